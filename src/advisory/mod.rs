// Advisory components: forecasting and load balancing hints

pub mod balancer;
pub mod forecast;

pub use balancer::{Advice, LoadBalancerAdvisor, LoadSource};
pub use forecast::{linear_trend, Forecaster, Trend};
