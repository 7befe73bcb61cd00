mod common;

use common::{channel, feed_xml, hours_ago, init_tracing, StaticFeedSource};
use std::sync::Arc;
use video_pipeline::types::*;
use video_pipeline::{ChannelRegistry, FeedPoller};

#[tokio::test]
async fn test_poll_yields_entries_inside_window() -> Result<()> {
    init_tracing();
    let source = Arc::new(StaticFeedSource::new());
    source.set_feed(
        "UC123",
        feed_xml(
            "UC123",
            &[
                ("fresh1", "Fresh one", hours_ago(1)),
                ("stale1", "Too old", hours_ago(48)),
                ("fresh2", "Fresh two", hours_ago(5)),
            ],
        ),
    );

    let poller = FeedPoller::new(source);
    let poll = poller.poll(&channel("UC123", "Test Channel"), hours_ago(24)).await?;
    let candidates: Vec<Candidate> = poll.collect();

    let ids: Vec<&str> = candidates.iter().map(|c| c.video_id.as_str()).collect();
    assert_eq!(ids, vec!["fresh1", "fresh2"]);
    assert_eq!(candidates[0].channel_id, "UC123");
    assert_eq!(candidates[0].title, "Fresh one");
    assert_eq!(candidates[0].url, "https://www.youtube.com/watch?v=fresh1");
    Ok(())
}

#[tokio::test]
async fn test_malformed_entries_are_skipped() -> Result<()> {
    init_tracing();
    let published = hours_ago(2).to_rfc3339();
    let xml = format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<feed xmlns="http://www.w3.org/2005/Atom">
  <id>yt:channel:UC123</id>
  <title>Test Channel</title>
  <entry>
    <id>yt:video:good1</id>
    <title>Good</title>
    <published>{published}</published>
  </entry>
  <entry>
    <id>tag:example.com,2024:no-video</id>
    <title>No id anywhere</title>
    <link rel="alternate" href="https://example.com/post/1"/>
    <published>{published}</published>
  </entry>
  <entry>
    <id>yt:video:notime1</id>
    <title>No timestamp</title>
  </entry>
  <entry>
    <id>yt:video:good2</id>
    <title>Also good</title>
    <published>{published}</published>
  </entry>
</feed>"#
    );

    let source = Arc::new(StaticFeedSource::new());
    source.set_feed("UC123", xml);

    let poller = FeedPoller::new(source);
    let mut poll = poller.poll(&channel("UC123", "Test Channel"), hours_ago(24)).await?;

    let mut ids = Vec::new();
    for candidate in poll.by_ref() {
        ids.push(candidate.video_id);
    }
    assert_eq!(ids, vec!["good1", "good2"]);
    assert_eq!(poll.malformed(), 2);
    Ok(())
}

#[tokio::test]
async fn test_unreachable_feed_is_feed_unavailable() -> Result<()> {
    init_tracing();
    let poller = FeedPoller::new(Arc::new(StaticFeedSource::new()));

    let err = poller
        .poll(&channel("UCgone", "Gone"), hours_ago(24))
        .await
        .err()
        .expect("poll should fail");
    assert!(matches!(err, PipelineError::FeedUnavailable { ref channel_id, .. } if channel_id == "UCgone"));
    Ok(())
}

#[tokio::test]
async fn test_unparsable_feed_is_feed_unavailable() -> Result<()> {
    init_tracing();
    let source = Arc::new(StaticFeedSource::new());
    source.set_feed("UC123", "<html><body>not a feed</body></html>".to_string());

    let poller = FeedPoller::new(source);
    let result = poller.poll(&channel("UC123", "Test Channel"), hours_ago(24)).await;
    assert!(matches!(result, Err(PipelineError::FeedUnavailable { .. })));
    Ok(())
}

#[test]
fn test_registry_lookup() {
    let registry = ChannelRegistry::builtin();
    assert_eq!(registry.len(), 12);

    let first = &registry.list_channels()[0];
    let found = registry.get_channel(&first.channel_id).unwrap();
    assert_eq!(found.name, first.name);
    assert!(found.feed_url.ends_with(&first.channel_id));

    assert!(matches!(
        registry.get_channel("UCnope"),
        Err(PipelineError::ChannelNotFound { .. })
    ));
}
