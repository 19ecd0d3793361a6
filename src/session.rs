//! # Session Contract
//!
//! The storage core is driven by sessions of the embedding database. Of the
//! full session surface (commands, schema, identity) the core consumes only
//! an identity for trace output and the autocommit flag; everything else
//! belongs to layers above this crate. The database monitor itself lives in
//! the store, not here.

/// A caller identity threaded through record operations.
#[derive(Debug, Clone)]
pub struct Session {
    id: u32,
    user: String,
    autocommit: bool,
}

impl Session {
    pub fn new(id: u32) -> Self {
        Self {
            id,
            user: String::new(),
            autocommit: true,
        }
    }

    pub fn with_user(id: u32, user: impl Into<String>) -> Self {
        Self {
            id,
            user: user.into(),
            autocommit: true,
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn user(&self) -> &str {
        &self.user
    }

    pub fn autocommit(&self) -> bool {
        self.autocommit
    }

    pub fn set_autocommit(&mut self, autocommit: bool) {
        self.autocommit = autocommit;
    }
}
