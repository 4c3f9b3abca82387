pub mod counter;
pub mod health;
