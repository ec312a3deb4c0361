//! JSON-lines change source: one [`ChangeSourceEvent`] per line.

use std::path::Path;

use anyhow::Context;
use async_trait::async_trait;
use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, BufReader, Lines};
use tokio::sync::watch;
use tracing::info;

use super::event::ChangeSourceEvent;
use super::streamer::ChangeStreamer;

/// An ordered feed of upstream events.
#[async_trait]
pub trait ChangeSource: Send {
    /// Next event, `None` at the end of the feed.
    async fn next_event(&mut self) -> anyhow::Result<Option<ChangeSourceEvent>>;
}

pub struct JsonLinesSource {
    lines: Lines<BufReader<File>>,
    line: usize,
}

impl JsonLinesSource {
    /// # Errors
    ///
    /// The file cannot be opened.
    pub async fn open(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let file = File::open(path)
            .await
            .with_context(|| format!("failed to open upstream feed {}", path.display()))?;
        Ok(Self {
            lines: BufReader::new(file).lines(),
            line: 0,
        })
    }
}

#[async_trait]
impl ChangeSource for JsonLinesSource {
    async fn next_event(&mut self) -> anyhow::Result<Option<ChangeSourceEvent>> {
        while let Some(line) = self.lines.next_line().await? {
            self.line += 1;
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            let event = serde_json::from_str(trimmed)
                .with_context(|| format!("malformed event on line {}", self.line))?;
            return Ok(Some(event));
        }
        Ok(None)
    }
}

/// Feeds every event of `source` into `streamer` until the feed ends or
/// shutdown is signalled. Returns the number of committed transactions.
///
/// # Errors
///
/// Read errors and events the streamer rejects.
pub async fn pump(
    source: &mut dyn ChangeSource,
    streamer: &ChangeStreamer,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<usize> {
    let mut committed = 0;
    loop {
        tokio::select! {
            event = source.next_event() => {
                let Some(event) = event? else {
                    info!(committed, "upstream feed finished");
                    return Ok(committed);
                };
                if streamer.process(event)?.is_some() {
                    committed += 1;
                }
            }
            _ = shutdown.changed() => return Ok(committed),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;
    use crate::replication::event::Publications;

    #[tokio::test]
    async fn pumps_a_feed_into_the_streamer() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, r#"{{"type":"begin","lsn":"0/1"}}"#).unwrap();
        writeln!(file, r#"{{"type":"insert","table":"issue","row":{{"id":1}}}}"#).unwrap();
        writeln!(file).unwrap();
        writeln!(file, r#"{{"type":"commit","lsn":"0/2"}}"#).unwrap();
        file.flush().unwrap();

        let streamer = ChangeStreamer::new(Publications::default(), 8);
        let mut source = JsonLinesSource::open(file.path()).await.unwrap();
        let (_stop, stop_rx) = watch::channel(false);
        let committed = pump(&mut source, &streamer, stop_rx).await.unwrap();
        assert_eq!(committed, 1);
        assert_eq!(streamer.subscribe(None).unwrap().catchup[0].changes.len(), 1);
    }

    #[tokio::test]
    async fn malformed_lines_name_their_position() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, r#"{{"type":"begin","lsn":"0/1"}}"#).unwrap();
        writeln!(file, "not json").unwrap();
        file.flush().unwrap();

        let mut source = JsonLinesSource::open(file.path()).await.unwrap();
        assert!(source.next_event().await.unwrap().is_some());
        let err = source.next_event().await.unwrap_err();
        assert!(err.to_string().contains("line 2"));
    }
}
