pub mod create;
pub mod delete;
pub mod list;
pub mod move_cmd;
pub mod rebuild;
pub mod show;
pub mod tree;
pub mod update;
pub mod watch;
