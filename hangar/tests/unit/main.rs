//! Hangar unit tests

mod common;
mod test_fsm;
mod test_health;
mod test_manager;
mod test_reaper;
