mod action;
mod condition;
mod deployment;
mod member;

pub use action::*;
pub use condition::*;
pub use deployment::*;
pub use member::*;
