pub mod run;
pub mod state;

// Re-export command functions for convenience
pub use run::{run, RunOptions};
pub use state::{backup, backups, next_slot, restore, status};
