pub mod earnings;
pub mod manager;
pub mod models;

#[cfg(test)]
mod tests;

pub use earnings::{EarningsCalendar, EarningsSource};
pub use manager::RiskManager;
pub use models::*;
