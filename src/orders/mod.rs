//! 秒杀订单流水线
//!
//! - [`service`] - 入站预订：窗口校验 → 铸造订单 ID → 原子预订评估
//! - [`consumer`] - 后台落库：消费预订流，崩溃安全地持久化订单
//! - [`types`] - 预订记录与请求上下文

pub mod consumer;
pub mod service;
pub mod types;

pub use consumer::OrderConsumer;
pub use service::SeckillService;
pub use types::{RequestContext, Reservation, ReservationRecord};
