mod poll_results_ws;

pub use poll_results_ws::poll_results_ws;
