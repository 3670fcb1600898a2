pub mod attendance;
pub mod backup;
pub mod classes;
pub mod core;
pub mod exams;
pub mod promotions;
pub mod reports;
pub mod results;
pub mod setup;
pub mod students;
