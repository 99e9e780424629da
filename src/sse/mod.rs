mod poll_updates_sse;

pub use poll_updates_sse::poll_updates_sse;
