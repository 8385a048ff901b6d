//! A single-writer, revisioned row store with a replicable change feed.
//!
//! Rows are ingested from delimited text, newline delimited JSON, in-memory objects or
//! framed binary rows, committed in batches and recorded in an append-only sequence
//! log. The log is served as a change feed over HTTP, and [`feed::pull`] replays a
//! remote feed into a local store.

#![deny(missing_docs, rustdoc::broken_intra_doc_links)]

pub mod codec;
pub mod config;
pub mod error;
pub mod feed;
pub mod formats;
pub mod http;
pub mod ingest;
pub mod metrics;
pub mod revision;
pub mod server;
pub mod state;
pub mod store;

pub use self::{
    error::{PipelineError, StoreError},
    revision::RevisionToken,
    store::{ColumnCatalog, CommitMode, Row, SequenceEntry, Store},
};

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use bytes::BytesMut;
    use serde_json::Value;
    use testresult::TestResult;
    use tokio_util::{codec::Decoder, sync::CancellationToken};
    use tracing_test::traced_test;

    use crate::{
        codec,
        feed::{self, PullOptions},
        formats::Input,
        ingest,
        server::Server,
        store::{backup_codec, ColumnCatalog, CommitMode, PendingRow, Row, Store},
    };

    fn snapshot(store: &Store) -> Vec<Row> {
        store
            .current_snapshot()
            .unwrap()
            .collect::<Result<Vec<_>, _>>()
            .unwrap()
    }

    async fn fill(store: &Store) -> TestResult {
        let csv = "name,age,city\nalice,30,berlin\nbob,41,\ncarol,,paris\n";
        let options = ingest::PipelineOptions {
            primary: "name".into(),
            ..Default::default()
        };
        ingest::spawn(store.clone(), Input::csv(csv.as_bytes(), b','), options.clone())
            .collect()
            .await?;
        let update = "name,age,city,email\nalice,31,berlin,\nbob,41,,bob@example.com\n";
        ingest::spawn(store.clone(), Input::csv(update.as_bytes(), b','), options)
            .collect()
            .await?;
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn pull_converges() -> TestResult {
        let source = Store::in_memory()?;
        fill(&source).await?;
        assert_eq!(source.seq(), 5);
        let (server, url) = Server::spawn_for_tests_with_store(source.clone()).await?;
        let feed_url = url.join("_changes")?;

        let local = Store::in_memory()?;
        let summary = feed::pull(&local, feed_url.clone(), PullOptions::default()).await?;
        assert_eq!(summary.last_seq, 5);
        assert_eq!(summary.received, 5);
        assert_eq!(summary.ingest.failed, 0);
        assert_eq!(local.columns()?, source.columns()?);
        assert_eq!(snapshot(&local), snapshot(&source));

        // replaying the whole feed again changes nothing
        let head = local.seq();
        let summary = feed::pull(&local, feed_url.clone(), PullOptions::default()).await?;
        assert_eq!(summary.skipped, 5);
        assert_eq!(summary.ingest.written, 0);
        assert_eq!(local.seq(), head);

        // resume from the cursor after a new remote write
        source.put("dave", codec::encode(&["dave", "22"]), None)?;
        let options = PullOptions {
            since: summary.last_seq,
            ..Default::default()
        };
        let summary = feed::pull(&local, feed_url, options).await?;
        assert_eq!(summary.received, 1);
        assert_eq!(summary.last_seq, 6);
        assert_eq!(snapshot(&local), snapshot(&source));

        server.shutdown().await?;
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn pull_follows_overwrite_to_earlier_value() -> TestResult {
        let source = Store::in_memory()?;
        source.add_columns(&["v".into()])?;
        let first = codec::encode(&["1"]);
        source.put("a", first.clone(), None)?;
        source.put("a", codec::encode(&["2"]), None)?;
        let (server, url) = Server::spawn_for_tests_with_store(source.clone()).await?;
        let feed_url = url.join("_changes")?;

        let local = Store::in_memory()?;
        let summary = feed::pull(&local, feed_url.clone(), PullOptions::default()).await?;
        assert_eq!(local.get("a")?.value, codec::encode(&["2"]));

        // an overwrite import brings back the first value under its initial revision
        source.commit(
            &[PendingRow {
                id: "a".into(),
                value: first.clone(),
                expected: None,
                adopted: None,
            }],
            CommitMode::Overwrite,
        )?;
        assert_eq!(source.get("a")?.rev.generation(), 1);
        let options = PullOptions {
            since: summary.last_seq,
            ..Default::default()
        };
        let summary = feed::pull(&local, feed_url.clone(), options).await?;
        assert_eq!(summary.ingest.written, 1);
        assert_eq!(local.get("a")?, source.get("a")?);

        // a full replay keeps the latest value
        let summary = feed::pull(&local, feed_url, PullOptions::default()).await?;
        assert_eq!(summary.skipped, 3);
        assert_eq!(local.get("a")?.value, first);

        server.shutdown().await?;
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn pull_from_compacted_source() -> TestResult {
        let source = Store::in_memory()?;
        fill(&source).await?;
        source.compact()?;
        assert_eq!(source.sequences(0, None).count(), 3);
        let (server, url) = Server::spawn_for_tests_with_store(source.clone()).await?;
        let feed_url = url.join("_changes")?;

        let local = Store::in_memory()?;
        let summary = feed::pull(&local, feed_url.clone(), PullOptions::default()).await?;
        assert_eq!(summary.received, 3);
        assert_eq!(summary.last_seq, 5);
        // revisions are taken over, not derived again from a shorter history
        assert_eq!(snapshot(&local), snapshot(&source));
        assert_eq!(local.get("alice")?.rev.generation(), 2);

        // both sides keep converging on later updates
        source.put("alice", codec::encode(&["alice", "32", "berlin"]), None)?;
        let options = PullOptions {
            since: summary.last_seq,
            ..Default::default()
        };
        feed::pull(&local, feed_url, options).await?;
        assert_eq!(snapshot(&local), snapshot(&source));

        server.shutdown().await?;
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn pull_keeps_binary_rows_verbatim() -> TestResult {
        let source = Store::in_memory()?;
        let frames = [
            codec::encode(&["k1", "x", ""]),
            codec::encode(&[&b"k2"[..], b"\xff\xfe", b""]),
        ];
        let mut data = Vec::new();
        for frame in &frames {
            data.extend_from_slice(&(frame.len() as u32).to_be_bytes());
            data.extend_from_slice(frame);
        }
        let options = ingest::PipelineOptions {
            primary: "key".into(),
            columns: vec!["key".into(), "a".into(), "b".into()],
            ..Default::default()
        };
        let (outcomes, _) = ingest::spawn(source.clone(), Input::binary(std::io::Cursor::new(data)), options)
            .collect()
            .await?;
        assert!(outcomes.iter().all(ingest::RowOutcome::is_success));
        // trailing empty fields are not stored
        assert_eq!(source.get("k1")?.value, codec::encode(&["k1", "x"]));
        let (server, url) = Server::spawn_for_tests_with_store(source.clone()).await?;

        let local = Store::in_memory()?;
        let summary = feed::pull(&local, url.join("_changes")?, PullOptions::default()).await?;
        assert_eq!(summary.ingest.failed, 0);
        assert_eq!(snapshot(&local), snapshot(&source));
        assert_eq!(
            local.get("k2")?.value,
            codec::encode(&[&b"k2"[..], b"\xff\xfe"])
        );

        server.shutdown().await?;
        Ok(())
    }

    #[tokio::test]
    async fn pull_rejects_diverging_columns() -> TestResult {
        let source = Store::in_memory()?;
        source.add_columns(&["name".into()])?;
        source.put("a", codec::encode(&["alice"]), None)?;
        let (server, url) = Server::spawn_for_tests_with_store(source).await?;

        let local = Store::in_memory()?;
        local.add_columns(&["other".into()])?;
        let res = feed::pull(&local, url.join("_changes")?, PullOptions::default()).await;
        assert!(res.is_err());
        assert!(local.get("a").unwrap_err().is_not_found());

        server.shutdown().await?;
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn cancelled_pull_reports_cursor() -> TestResult {
        let (server, url) = Server::spawn_for_tests().await?;
        let source = server.store().clone();
        source.add_columns(&["v".into()])?;
        source.put("a", codec::encode(&["1"]), None)?;
        source.put("b", codec::encode(&["2"]), None)?;

        let local = Store::in_memory()?;
        let cancel = CancellationToken::new();
        let options = PullOptions {
            live: true,
            cancel: cancel.clone(),
            ..Default::default()
        };
        let pull = tokio::task::spawn({
            let local = local.clone();
            let url = url.join("_changes")?;
            async move { feed::pull(&local, url, options).await }
        });
        for _ in 0..100 {
            if local.get("b").is_ok() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        cancel.cancel();
        let summary = tokio::time::timeout(Duration::from_secs(5), pull).await???;
        assert!(summary.interrupted);
        assert_eq!(summary.last_seq, 2);
        assert_eq!(summary.ingest.written, 2);
        assert_eq!(local.get("b")?.value, codec::encode(&["2"]));

        server.shutdown().await?;
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn live_pull_follows_remote() -> TestResult {
        let (server, url) = Server::spawn_for_tests().await?;
        let source = server.store().clone();
        source.add_columns(&["v".into()])?;
        source.put("a", codec::encode(&["1"]), None)?;

        let local = Store::in_memory()?;
        let options = PullOptions {
            live: true,
            ..Default::default()
        };
        let pull = tokio::task::spawn({
            let local = local.clone();
            let url = url.join("_changes")?;
            async move { feed::pull(&local, url, options).await }
        });

        source.put("b", codec::encode(&["2"]), None)?;
        let mut synced = false;
        for _ in 0..100 {
            if local.get("b").is_ok() {
                synced = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert!(synced, "live pull did not deliver the new row");

        // closing the remote store ends the live feed
        server.shutdown().await?;
        let summary = tokio::time::timeout(Duration::from_secs(5), pull).await???;
        assert_eq!(summary.last_seq, 2);
        assert_eq!(snapshot(&local), snapshot(&source));
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn http_bulk_and_rows() -> TestResult {
        let (server, url) = Server::spawn_for_tests().await?;
        let client = reqwest::Client::new();

        let res = client
            .post(url.join("_bulk?format=csv&primary=name")?)
            .body("name,age\nalice,30\nbob,41\n")
            .send()
            .await?
            .error_for_status()?
            .text()
            .await?;
        let lines = res
            .lines()
            .map(serde_json::from_str::<Value>)
            .collect::<Result<Vec<_>, _>>()?;
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0]["status"], "committed");
        assert_eq!(lines[0]["id"], "alice");
        assert_eq!(lines[1]["seq"], 2);
        assert_eq!(lines[2]["status"], "done");
        assert_eq!(lines[2]["summary"]["written"], 2);

        let row: Value = client
            .get(url.join("rows/alice")?)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        assert_eq!(row["value"]["age"], "30");

        let missing = client.get(url.join("rows/nobody")?).send().await?;
        assert_eq!(missing.status(), reqwest::StatusCode::NOT_FOUND);

        let columns: Vec<String> = client
            .get(url.join("_columns")?)
            .send()
            .await?
            .json()
            .await?;
        assert_eq!(columns, vec!["name", "age"]);

        let bad = client
            .post(url.join("_bulk?format=xml")?)
            .body("")
            .send()
            .await?;
        assert_eq!(bad.status(), reqwest::StatusCode::BAD_REQUEST);

        let feed = client
            .get(url.join("_changes?since=1&live=false")?)
            .send()
            .await?
            .text()
            .await?;
        assert_eq!(feed.lines().count(), 1);

        let rows = client.get(url.join("_snapshot")?).send().await?.text().await?;
        assert_eq!(rows.lines().count(), 2);

        let dump = client
            .get(url.join("_backup")?)
            .send()
            .await?
            .error_for_status()?
            .bytes()
            .await?;
        let mut buf = BytesMut::from(&dump[..]);
        let mut codec = backup_codec();
        let mut frames = Vec::new();
        while let Some(frame) = codec.decode(&mut buf)? {
            frames.push(frame.freeze());
        }
        let copy = Store::in_memory()?;
        copy.restore(frames)?;
        assert_eq!(snapshot(&copy), snapshot(server.store()));
        assert_eq!(copy.columns()?, vec!["name", "age"]);

        server.shutdown().await?;
        Ok(())
    }
}
