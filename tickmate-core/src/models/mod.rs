pub mod session;
pub mod trading;
