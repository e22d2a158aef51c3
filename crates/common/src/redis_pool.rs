use redis::aio::ConnectionManager;
use redis::{Client, RedisResult};

/// Open a Redis client handle without connecting.
///
/// The client is cheap to clone; each concurrent unit derives its own
/// connection from it.
pub fn open_client(redis_url: &str) -> RedisResult<Client> {
    Client::open(redis_url)
}

/// Create a Redis connection manager for async operations.
pub async fn create_redis_pool(client: &Client) -> RedisResult<ConnectionManager> {
    let manager = ConnectionManager::new(client.clone()).await?;

    tracing::debug!("Connected to Redis");
    Ok(manager)
}
