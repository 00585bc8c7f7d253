pub mod health_loop;
pub mod tier_scheduler;
