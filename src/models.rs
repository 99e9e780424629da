use serde::{Deserialize, Serialize};
use std::fmt;

macro_rules! opaque_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            #[allow(dead_code)]
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl From<&str> for $name {
            fn from(id: &str) -> Self {
                Self(id.to_owned())
            }
        }

        impl From<String> for $name {
            fn from(id: String) -> Self {
                Self(id)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }
    };
}

opaque_id!(
    /// Identifier of a poll, owned by whoever manages poll records.
    PollId
);
opaque_id!(
    /// Identifier of an option, scoped to its poll's counter set.
    OptionId
);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TallyEntry {
    pub option_id: OptionId,
    pub count: u64,
}

impl TallyEntry {
    pub fn new(option_id: impl Into<OptionId>, count: u64) -> Self {
        Self {
            option_id: option_id.into(),
            count,
        }
    }
}

/// Point-in-time rendering of a poll's tally, as pushed to observers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TallySnapshot {
    pub poll_id: PollId,
    pub options: Vec<TallyEntry>,
    pub total: u64,
}

impl TallySnapshot {
    /// `options` must already be in tally order.
    pub fn new(poll_id: PollId, options: Vec<TallyEntry>) -> Self {
        let total = options.iter().map(|entry| entry.count).sum();
        Self {
            poll_id,
            options,
            total,
        }
    }
}

/// Orders entries by descending count, then ascending option id.
pub fn sort_tally(entries: &mut [TallyEntry]) {
    entries.sort_by(|a, b| {
        b.count
            .cmp(&a.count)
            .then_with(|| a.option_id.cmp(&b.option_id))
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn ties_break_on_ascending_option_id() {
        let mut entries = vec![
            TallyEntry::new("c", 1),
            TallyEntry::new("b", 4),
            TallyEntry::new("a", 1),
            TallyEntry::new("d", 4),
        ];
        sort_tally(&mut entries);

        let order: Vec<&str> = entries.iter().map(|e| e.option_id.as_str()).collect();
        assert_eq!(order, ["b", "d", "a", "c"]);
    }

    #[test]
    fn snapshot_wire_shape() {
        let snapshot = TallySnapshot::new(
            PollId::from("p1"),
            vec![TallyEntry::new("a", 2), TallyEntry::new("b", 1)],
        );

        assert_eq!(
            serde_json::to_value(&snapshot).unwrap(),
            json!({
                "pollId": "p1",
                "options": [
                    {"optionId": "a", "count": 2},
                    {"optionId": "b", "count": 1},
                ],
                "total": 3,
            })
        );
    }

    #[test]
    fn empty_snapshot_has_zero_total() {
        let snapshot = TallySnapshot::new(PollId::from("p1"), Vec::new());
        assert_eq!(
            serde_json::to_string(&snapshot).unwrap(),
            r#"{"pollId":"p1","options":[],"total":0}"#
        );
    }
}
