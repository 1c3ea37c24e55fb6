//! Command registry
//!
//! Maps wire command codes to message kinds. Built once at startup and
//! handed to the codec.

use std::collections::HashMap;

use super::message::MessageKind;

/// Immutable command code table
#[derive(Debug, Clone)]
pub struct CommandRegistry {
    table: HashMap<i32, MessageKind>,
}

impl CommandRegistry {
    /// The standard table
    pub fn new() -> Self {
        let kinds = [
            MessageKind::Discovery,
            MessageKind::Broadcast,
            MessageKind::Direct,
            MessageKind::Update,
            MessageKind::Delete,
            MessageKind::Get,
            MessageKind::Value,
            MessageKind::Set,
            MessageKind::BeginTx,
            MessageKind::Commit,
            MessageKind::Committed,
            MessageKind::Ack,
            MessageKind::GetHistory,
            MessageKind::History,
            MessageKind::Inventory,
        ];

        let mut table: HashMap<i32, MessageKind> =
            kinds.iter().map(|kind| (kind.code(), *kind)).collect();

        // FIXME: code 6 decodes as Update alongside 4. Kept for wire
        // compatibility with older peers; nothing ever sends it.
        table.insert(LEGACY_UPDATE_CODE, MessageKind::Update);

        Self { table }
    }

    pub fn lookup(&self, code: i32) -> Option<MessageKind> {
        self.table.get(&code).copied()
    }

    pub fn len(&self) -> usize {
        self.table.len()
    }
}

impl Default for CommandRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Second code that also selects Update
pub const LEGACY_UPDATE_CODE: i32 = 6;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registered_codes() {
        let registry = CommandRegistry::new();
        assert_eq!(registry.len(), 16);
        assert_eq!(registry.lookup(0), Some(MessageKind::Discovery));
        assert_eq!(registry.lookup(4), Some(MessageKind::Update));
        assert_eq!(registry.lookup(6), Some(MessageKind::Update));
        assert_eq!(registry.lookup(17), Some(MessageKind::Inventory));
    }

    #[test]
    fn test_reserved_codes_unmapped() {
        let registry = CommandRegistry::new();
        assert_eq!(registry.lookup(1), None);
        assert_eq!(registry.lookup(11), None);
        assert_eq!(registry.lookup(18), None);
        assert_eq!(registry.lookup(-1), None);
    }

    #[test]
    fn test_codes_map_back_to_kind() {
        let registry = CommandRegistry::new();
        for code in [0, 2, 3, 4, 5, 7, 8, 9, 10, 12, 13, 14, 15, 16, 17] {
            let kind = registry.lookup(code).unwrap();
            assert_eq!(kind.code(), code);
        }
    }
}
