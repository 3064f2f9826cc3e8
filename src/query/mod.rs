pub mod operation;
pub mod chain;
pub mod ident;
pub mod persistence;
