use std::path::Path;
use std::process::Command;

use thumbly_worker::WorkerConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let config = WorkerConfig::from_env();

    println!(
        "worker-selfcheck: starting with output_dir={}",
        config.output_dir.display()
    );
    ensure_dir(&config.upload_dir).await?;
    ensure_dir(&config.output_dir).await?;
    ensure_ffmpeg(&config.media.ffmpeg_bin)?;
    ensure_store(&config.database_url).await?;
    ensure_redis(&config.queue.redis_url).await?;

    println!("worker-selfcheck: ok");
    Ok(())
}

async fn ensure_dir<P: AsRef<Path>>(path: P) -> anyhow::Result<()> {
    let path = path.as_ref();
    tokio::fs::create_dir_all(path).await?;
    let probe = path.join(".selfcheck");
    tokio::fs::write(&probe, b"ok").await?;
    tokio::fs::remove_file(&probe).await?;
    Ok(())
}

fn ensure_ffmpeg(bin: &str) -> anyhow::Result<()> {
    let output = Command::new(bin)
        .arg("-version")
        .output()
        .map_err(|e| anyhow::anyhow!("{} not available: {}", bin, e))?;

    if !output.status.success() {
        return Err(anyhow::anyhow!(
            "{} -version failed: {:?}",
            bin,
            output.status
        ));
    }
    Ok(())
}

async fn ensure_store(database_url: &str) -> anyhow::Result<()> {
    let pool = thumbly_store::connect(database_url, 1).await?;
    thumbly_store::init_schema(&pool).await?;
    Ok(())
}

async fn ensure_redis(redis_url: &str) -> anyhow::Result<()> {
    let client = redis::Client::open(redis_url)?;
    let mut conn = client.get_multiplexed_async_connection().await?;
    redis::cmd("PING").query_async::<String>(&mut conn).await?;
    Ok(())
}
