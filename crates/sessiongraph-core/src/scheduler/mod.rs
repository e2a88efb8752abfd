//! Cron scheduling of maintenance jobs

mod cron;
mod schedule;

pub use cron::CronSchedule;
pub use schedule::{plan_jobs, ScheduleConfig, ScheduledTask, Scheduler};
