// dtos/mod.rs
pub mod referraldtos;
