pub mod admin;
pub mod worker;
