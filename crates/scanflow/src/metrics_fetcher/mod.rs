mod fetch;

pub use fetch::MetricsFetcher;
