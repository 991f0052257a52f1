pub mod attendance;
pub mod backup;
pub mod batches;
pub mod core;
pub mod courses;
pub mod evaluator;
pub mod justifications;
pub mod reports;
pub mod setup;
pub mod student_views;
pub mod students;
pub mod teachers;
pub mod users;
