pub mod accounts;
pub mod start;
