//! Key namespaces inside the shared `kv` table.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Namespace {
    /// `ledger:<entityId>` pending change records.
    Ledger,
    /// `timer:<widgetInstanceId>` persisted timer sessions.
    Timer,
    /// `snapshot:<widgetInstanceId>` rendered widget state.
    Snapshot,
    /// `widget:<widgetInstanceId>` widget bindings.
    Widget,
    /// `deadletter:<entityId>` entries that kept failing to apply.
    DeadLetter,
}

impl Namespace {
    pub fn prefix(&self) -> &'static str {
        match self {
            Namespace::Ledger => "ledger:",
            Namespace::Timer => "timer:",
            Namespace::Snapshot => "snapshot:",
            Namespace::Widget => "widget:",
            Namespace::DeadLetter => "deadletter:",
        }
    }

    pub fn key(&self, id: &str) -> String {
        format!("{}{}", self.prefix(), id)
    }

    pub fn id_from<'k>(&self, key: &'k str) -> Option<&'k str> {
        key.strip_prefix(self.prefix())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_round_trip_through_prefix() {
        let key = Namespace::Ledger.key("goal:42");
        assert_eq!(key, "ledger:goal:42");
        assert_eq!(Namespace::Ledger.id_from(&key), Some("goal:42"));
        assert_eq!(Namespace::Timer.id_from(&key), None);
    }
}
