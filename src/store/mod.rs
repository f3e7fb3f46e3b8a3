pub mod tasks;
pub mod schedules;

pub use tasks::{ListQuery, StatusUpdate, TaskRepository};
pub use schedules::ScheduleRepository;
