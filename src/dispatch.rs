// Copyright 2020 Joyent, Inc.

//! Command code to handler mapping.
//!
//! Each concrete plugin or gate builds its own table at construction time
//! and hands it to the interface, which never changes it afterwards.
//! Registering a code twice replaces the earlier handler, which is how a
//! backend overrides a built-in command.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::error::Result;
use crate::interface::CommandContext;
use crate::protocol;

pub type CommandHandler = Arc<dyn Fn(&CommandContext<'_>) -> Result<()> + Send + Sync>;

#[derive(Clone, Default)]
pub struct CommandDispatchTable {
    handlers: HashMap<u16, CommandHandler>,
}

impl CommandDispatchTable {
    pub fn new() -> CommandDispatchTable {
        CommandDispatchTable::default()
    }

    /// Returns the handler previously registered for `code`, if any.
    pub fn register<C, F>(&mut self, code: C, handler: F) -> Option<CommandHandler>
    where
        C: Into<u16>,
        F: Fn(&CommandContext<'_>) -> Result<()> + Send + Sync + 'static,
    {
        self.handlers.insert(code.into(), Arc::new(handler))
    }

    /// Moves every handler of `other` into this table, replacing handlers
    /// registered for the same codes.
    pub fn merge(&mut self, other: CommandDispatchTable) {
        self.handlers.extend(other.handlers);
    }

    pub fn get(&self, code: u16) -> Option<CommandHandler> {
        self.handlers.get(&code).cloned()
    }

    pub fn contains(&self, code: u16) -> bool {
        self.handlers.contains_key(&code)
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl fmt::Debug for CommandDispatchTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut codes: Vec<u16> = self.handlers.keys().cloned().collect();
        codes.sort();
        f.debug_list()
            .entries(codes.into_iter().map(protocol::command_code_name))
            .finish()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    use crate::protocol::HapiCommandCode;

    #[test]
    fn last_registration_wins() {
        let mut table = CommandDispatchTable::new();
        assert!(table
            .register(HapiCommandCode::ReqFetchItems, |_ctx: &CommandContext<'_>| Ok(()))
            .is_none());
        let replaced = table.register(HapiCommandCode::ReqFetchItems, |_ctx: &CommandContext<'_>| {
            Ok(())
        });
        assert!(replaced.is_some());
        assert_eq!(table.len(), 1);
        assert!(table.contains(HapiCommandCode::ReqFetchItems.code()));
        assert!(table.get(0x1234).is_none());
        assert_eq!(format!("{:?}", table), "[\"ReqFetchItems\"]");
    }
}
