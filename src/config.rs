// config.rs
#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    /// Base URL referral links are built against, e.g. "https://book.example.com".
    pub app_url: String,
    pub max_db_connections: u32,
}

impl Config {
    pub fn init() -> Config {
        let database_url = std::env::var("DATABASE_URL").expect("DATABASE_URL must be set");
        let app_url =
            std::env::var("APP_URL").unwrap_or_else(|_| "http://localhost:8000".to_string());
        let max_db_connections = std::env::var("MAX_DB_CONNECTIONS")
            .ok()
            .and_then(|v| v.parse::<u32>().ok())
            .unwrap_or(10);

        Config {
            database_url,
            app_url,
            max_db_connections,
        }
    }
}
