pub mod oracle_http;
pub mod postgres;
pub mod settlement_http;

pub use oracle_http::HttpPriceOracle;
pub use postgres::PostgresStore;
pub use settlement_http::HttpSettlementGateway;
