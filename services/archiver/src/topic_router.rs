use serde::{Deserialize, Serialize};
use std::fmt;

/// Storage folder a message is archived under
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    EntryLogs,
    ExitLogs,
    PaymentLogs,
    DoorLogs,
    /// Catch-all for topics that match no keyword
    OtherLogs,
}

impl Category {
    pub fn as_str(&self) -> &'static str {
        match self {
            Category::EntryLogs => "entry_logs",
            Category::ExitLogs => "exit_logs",
            Category::PaymentLogs => "payment_logs",
            Category::DoorLogs => "door_logs",
            Category::OtherLogs => "other_logs",
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Keyword table, checked in order. The first keyword contained in the topic wins.
const ROUTES: [(&str, Category); 4] = [
    ("entries", Category::EntryLogs),
    ("exits", Category::ExitLogs),
    ("paymenttransactions", Category::PaymentLogs),
    ("door-transitions", Category::DoorLogs),
];

/// Map a topic to its storage category.
///
/// Case-sensitive substring match against the keyword table; topics with no
/// matching keyword land in [`Category::OtherLogs`].
pub fn categorize(topic: &str) -> Category {
    ROUTES
        .iter()
        .find(|(keyword, _)| topic.contains(keyword))
        .map(|(_, category)| *category)
        .unwrap_or(Category::OtherLogs)
}

#[cfg(test)]
mod tests {
    use super::*;

    const FACILITY: &str = "/carparks/815768fd-aa5c-4ca2-8315-88c98662046a/events";

    #[test]
    fn test_categorize_known_streams() {
        assert_eq!(
            categorize(&format!("{}/entries/lane1", FACILITY)),
            Category::EntryLogs
        );
        assert_eq!(
            categorize(&format!("{}/exits/lane2", FACILITY)),
            Category::ExitLogs
        );
        assert_eq!(
            categorize(&format!("{}/paymenttransactions/pos-3", FACILITY)),
            Category::PaymentLogs
        );
        assert_eq!(
            categorize(&format!("{}/door-transitions/north", FACILITY)),
            Category::DoorLogs
        );
    }

    #[test]
    fn test_categorize_unknown_topic_defaults_to_other() {
        assert_eq!(categorize(&format!("{}/heartbeat", FACILITY)), Category::OtherLogs);
        assert_eq!(categorize(""), Category::OtherLogs);
    }

    #[test]
    fn test_categorize_is_case_sensitive() {
        assert_eq!(categorize("/carparks/x/events/ENTRIES"), Category::OtherLogs);
        assert_eq!(categorize("/carparks/x/events/Door-Transitions"), Category::OtherLogs);
    }

    #[test]
    fn test_categorize_matches_substring_anywhere() {
        assert_eq!(categorize("legacy-entries-feed"), Category::EntryLogs);
        assert_eq!(categorize("paymenttransactions"), Category::PaymentLogs);
    }

    #[test]
    fn test_categorize_first_keyword_wins() {
        // "entries" precedes "exits" in the table regardless of topic position
        assert_eq!(categorize("/exits/entries"), Category::EntryLogs);
        assert_eq!(categorize("/door-transitions/exits"), Category::ExitLogs);
    }

    #[test]
    fn test_category_display() {
        assert_eq!(Category::EntryLogs.to_string(), "entry_logs");
        assert_eq!(Category::OtherLogs.to_string(), "other_logs");
        assert_eq!(
            serde_json::to_string(&Category::PaymentLogs).unwrap(),
            "\"payment_logs\""
        );
    }
}
