//! # Command Registry
//!
//! Categories group commands under a shared [`Access`] policy. The registry
//! is populated before `start()` and then frozen behind an `Arc`, so the
//! proxy and workers read it concurrently without locks.

use std::collections::HashMap;
use std::sync::Arc;

use crate::auth::Access;
use crate::error::Error;
use crate::message::Message;

/// Handler invoked on a worker thread for each admitted command.
pub type CommandHandler = Arc<dyn Fn(Message) + Send + Sync>;

/// Worker lane a command's handler runs on. Replies to outstanding requests
/// always use the dedicated reply lane; commands choose between the general
/// lane (default) and the batch lane.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Lane {
    General,
    Batch,
    Reply,
}

pub(crate) struct CommandSpec {
    pub handler: CommandHandler,
    /// Requests carry a reply tag and may call `send_reply`; notifications
    /// may not.
    pub is_request: bool,
    pub lane: Lane,
}

pub(crate) struct Category {
    pub access: Access,
    pub commands: HashMap<String, CommandSpec>,
}

/// Category and command names: `[A-Za-z0-9_-]+`, no dots.
pub(crate) fn valid_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-')
}

#[derive(Default)]
pub(crate) struct Registry {
    categories: HashMap<String, Category>,
}

impl Registry {
    pub fn add_category(&mut self, name: &str, access: Access) -> Result<(), Error> {
        if !valid_name(name) {
            return Err(Error::InvalidName(name.to_string()));
        }
        if self.categories.contains_key(name) {
            return Err(Error::DuplicateCategory(name.to_string()));
        }
        self.categories.insert(
            name.to_string(),
            Category {
                access,
                commands: HashMap::new(),
            },
        );
        Ok(())
    }

    pub fn add_command(
        &mut self,
        category: &str,
        name: &str,
        handler: CommandHandler,
        is_request: bool,
        lane: Lane,
    ) -> Result<(), Error> {
        if !valid_name(name) {
            return Err(Error::InvalidName(name.to_string()));
        }
        let cat = self
            .categories
            .get_mut(category)
            .ok_or_else(|| Error::UnknownCategory(category.to_string()))?;
        if cat.commands.contains_key(name) {
            return Err(Error::DuplicateCommand(
                name.to_string(),
                category.to_string(),
            ));
        }
        cat.commands.insert(
            name.to_string(),
            CommandSpec {
                handler,
                is_request,
                lane,
            },
        );
        Ok(())
    }

    /// Look up `category.command`. Average O(1): one split, two hash probes.
    pub fn lookup(&self, full_name: &str) -> Option<(&Category, &CommandSpec)> {
        let (cat_name, cmd_name) = full_name.split_once('.')?;
        let cat = self.categories.get(cat_name)?;
        let cmd = cat.commands.get(cmd_name)?;
        Some((cat, cmd))
    }

    pub fn freeze(self) -> Arc<Registry> {
        Arc::new(self)
    }
}
