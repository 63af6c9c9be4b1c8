use crate::{common::*, message as msg};
use tfrecord::{EventAsyncWriter, EventWriterConfig};

pub async fn logging_worker(
    log_dir: impl AsRef<Path>,
    log_rx: flume::Receiver<msg::LogMessage>,
) -> Result<()> {
    let log_dir = log_dir.as_ref();
    tokio::fs::create_dir_all(log_dir).await?;

    let mut event_writer = {
        let event_path_prefix = log_dir
            .join("events")
            .into_os_string()
            .into_string()
            .map_err(|path| format_err!("non-UTF-8 log path {:?}", path))?;

        EventAsyncWriter::from_prefix(event_path_prefix, "", EventWriterConfig::default()).await?
    };

    while let Ok(msg) = log_rx.recv_async().await {
        match msg {
            msg::LogMessage::Scalars { step, scalars } => {
                let step = step as i64;

                for (tag, value) in scalars {
                    event_writer
                        .write_scalar(tag, step, value as f32)
                        .await?;
                }
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn writes_event_file() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let (log_tx, log_rx) = flume::unbounded();

        let mut scalars = IndexMap::new();
        scalars.insert("0th_D/d".to_string(), 0.5);
        scalars.insert("0th_G/g".to_string(), 1.5);
        log_tx.send(msg::LogMessage::Scalars { step: 0, scalars })?;
        drop(log_tx);

        let runtime = tokio::runtime::Runtime::new()?;
        runtime.block_on(logging_worker(dir.path(), log_rx))?;

        let num_files = fs::read_dir(dir.path())?
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_name().to_string_lossy().starts_with("events"))
            .count();
        ensure!(num_files == 1);
        Ok(())
    }
}
