//! Which part of the page each participant is looking at, and the counts
//! everyone sees.

use serde::{Deserialize, Serialize};

/// A connection starts on [`Tab::Idle`] and moves with the `tab` command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tab {
    Story,
    Chat,
    #[default]
    Idle,
}

impl Tab {
    pub fn parse(name: &str) -> Option<Tab> {
        match name {
            "story" => Some(Tab::Story),
            "chat" => Some(Tab::Chat),
            "idle" => Some(Tab::Idle),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct Counts {
    pub story: usize,
    pub chat: usize,
    pub idle: usize,
}

impl Counts {
    pub fn tally(tabs: impl IntoIterator<Item = Tab>) -> Counts {
        let mut counts = Counts::default();
        for tab in tabs {
            match tab {
                Tab::Story => counts.story += 1,
                Tab::Chat => counts.chat += 1,
                Tab::Idle => counts.idle += 1,
            }
        }
        counts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tally_by_tab() {
        let counts = Counts::tally([Tab::Idle, Tab::Chat, Tab::Idle, Tab::Story]);
        assert_eq!(counts, Counts { story: 1, chat: 1, idle: 2 });
        assert_eq!(Counts::tally([]), Counts::default());
    }

    #[test]
    fn tab_names() {
        assert_eq!(Tab::parse("chat"), Some(Tab::Chat));
        assert_eq!(Tab::parse("lobby"), None);
        assert_eq!(Tab::default(), Tab::Idle);
    }
}
