//! End-to-end scenarios for the cache synchronizer against the in-memory
//! stores, including the cross-store operation ordering laws.

use chrono::Utc;
use url::Url;

use prerender::keys::{build_kv_key, build_object_key, sha256_hex};
use prerender::models::{IndexRecord, SyncSettings};
use prerender::seo;
use prerender::store::{MemBlobStore, MemKvStore, OpJournal};
use prerender::sync::{sync_rendered_page, HTML_CONTENT_TYPE};

const TARGET: &str = "https://example.com/page?b=2&a=1";
const FINAL_URL: &str = "https://example.com/page?a=1&b=2";
const HTML: &str = "<html><head><title>Page</title></head><body><h1>Page</h1></body></html>";

fn settings() -> SyncSettings {
    SyncSettings {
        cache_ttl: 3600,
        user_agent: "test-agent".to_string(),
        accept: None,
    }
}

fn kv_key() -> String {
    build_kv_key(&Url::parse(FINAL_URL).unwrap()).unwrap()
}

fn prior_record(object_key: &str) -> String {
    let record = IndexRecord {
        url: TARGET.to_string(),
        object_key: object_key.to_string(),
        digest: sha256_hex("old body"),
        created_at: Utc::now(),
        content_type: HTML_CONTENT_TYPE.to_string(),
        content_length: 8,
        cache_version: "v1".to_string(),
        user_agent: "test-agent".to_string(),
        accept: None,
    };
    serde_json::to_string(&record).unwrap()
}

async fn run_sync(blob: &MemBlobStore, kv: &MemKvStore) -> prerender::sync::SyncOutcome {
    let analysis = seo::analyze(HTML, 200, FINAL_URL, None);
    sync_rendered_page(blob, kv, TARGET, FINAL_URL, HTML, &analysis, &settings()).await
}

#[test]
fn identical_urls_share_one_kv_key() {
    // Cosmetic variation — internal params, reordering — maps to one key.
    let a = Url::parse("https://example.com/p?b=2&a=1&to_html=1").unwrap();
    let b = Url::parse("https://example.com/p?a=1&b=2").unwrap();
    assert_eq!(build_kv_key(&a).unwrap(), "to_html:v1:example.com:/p?a=1&b=2");
    assert_eq!(build_kv_key(&a).unwrap(), build_kv_key(&b).unwrap());
}

#[tokio::test]
async fn fresh_publish_writes_blob_then_record() {
    let journal = OpJournal::new();
    let blob = MemBlobStore::new(journal.clone());
    let kv = MemKvStore::new(journal.clone());

    let outcome = run_sync(&blob, &kv).await;
    assert!(outcome.r2_synced);
    assert!(outcome.kv_synced);

    let entries = journal.entries();
    assert_eq!(entries.len(), 3);
    assert!(entries[0].starts_with("blob.put v1/example.com/page_"));
    assert_eq!(entries[1], format!("kv.get {}", kv_key()));
    assert_eq!(entries[2], format!("kv.put {}", kv_key()));

    // The record parses and points at the uploaded blob.
    let record: IndexRecord = serde_json::from_str(&kv.value(&kv_key()).unwrap()).unwrap();
    assert_eq!(record.url, TARGET);
    assert_eq!(record.digest, sha256_hex(HTML));
    assert_eq!(record.content_length, HTML.len() as u64);
    assert_eq!(record.cache_version, "v1");
    assert!(blob.contains(&record.object_key));
    assert_eq!(kv.ttl(&kv_key()), Some(3600));

    let upload = blob.stored(&record.object_key).unwrap();
    assert_eq!(upload.content_type, HTML_CONTENT_TYPE);
    assert_eq!(upload.cache_control, "public, max-age=3600, s-maxage=3600");
    assert_eq!(upload.metadata.get("url"), Some(&TARGET.to_string()));
    assert_eq!(upload.metadata.get("title"), Some(&"Page".to_string()));
    assert_eq!(upload.metadata.get("accept"), Some(&String::new()));
}

#[tokio::test]
async fn stale_blob_is_invalidated_on_republish() {
    let journal = OpJournal::new();
    let blob = MemBlobStore::new(journal.clone());
    let kv = MemKvStore::new(journal.clone());

    let old_key = "v1/example.com/page_aaaaaaaaaaaaaaaa_20250101T000000000Z.html";
    blob.seed(old_key);
    kv.seed(&kv_key(), &prior_record(old_key));

    let outcome = run_sync(&blob, &kv).await;
    assert!(outcome.r2_synced);
    assert!(outcome.kv_synced);

    let entries = journal.entries();
    assert_eq!(entries.len(), 4);
    assert!(entries[0].starts_with("blob.put "));
    assert_eq!(entries[1], format!("kv.get {}", kv_key()));
    assert_eq!(entries[2], format!("blob.delete {}", old_key));
    assert_eq!(entries[3], format!("kv.put {}", kv_key()));

    // Old blob gone, new blob present, record flipped.
    assert!(!blob.contains(old_key));
    let record: IndexRecord = serde_json::from_str(&kv.value(&kv_key()).unwrap()).unwrap();
    assert_ne!(record.object_key, old_key);
    assert!(blob.contains(&record.object_key));
}

#[tokio::test]
async fn blob_put_failure_stops_everything() {
    let journal = OpJournal::new();
    let blob = MemBlobStore::new(journal.clone()).failing_put();
    let kv = MemKvStore::new(journal.clone());
    kv.seed(&kv_key(), &prior_record("v1/example.com/page_old.html"));

    let outcome = run_sync(&blob, &kv).await;
    assert!(!outcome.r2_synced);
    assert!(!outcome.kv_synced);

    // No KV read, no KV put, no blob delete.
    let entries = journal.entries();
    assert_eq!(entries.len(), 1);
    assert!(entries[0].starts_with("blob.put "));
}

#[tokio::test]
async fn kv_put_failure_keeps_the_blob() {
    let journal = OpJournal::new();
    let blob = MemBlobStore::new(journal.clone());
    let kv = MemKvStore::new(journal.clone()).failing_put();

    let outcome = run_sync(&blob, &kv).await;
    assert!(outcome.r2_synced);
    assert!(!outcome.kv_synced);

    // Blob put completed before the KV put was attempted; no rollback.
    let entries = journal.entries();
    assert_eq!(entries.len(), 3);
    assert!(entries[0].starts_with("blob.put "));
    assert_eq!(entries[1], format!("kv.get {}", kv_key()));
    assert_eq!(entries[2], format!("kv.put {}", kv_key()));

    let new_key = entries[0].trim_start_matches("blob.put ").to_string();
    assert!(blob.contains(&new_key));
}

#[tokio::test]
async fn kv_read_failure_skips_invalidation_but_publishes() {
    let journal = OpJournal::new();
    let blob = MemBlobStore::new(journal.clone());
    let kv = MemKvStore::new(journal.clone()).failing_get();

    let outcome = run_sync(&blob, &kv).await;
    assert!(outcome.r2_synced);
    assert!(outcome.kv_synced);

    // No delete was issued; the flip still happened.
    assert!(journal.entries().iter().all(|e| !e.starts_with("blob.delete")));
    assert!(kv.value(&kv_key()).is_some());
}

#[tokio::test]
async fn blob_delete_failure_does_not_alter_outcome() {
    let journal = OpJournal::new();
    let blob = MemBlobStore::new(journal.clone()).failing_delete();
    let kv = MemKvStore::new(journal.clone());

    let old_key = "v1/example.com/page_bbbbbbbbbbbbbbbb_20250101T000000000Z.html";
    blob.seed(old_key);
    kv.seed(&kv_key(), &prior_record(old_key));

    let outcome = run_sync(&blob, &kv).await;
    assert!(outcome.r2_synced);
    assert!(outcome.kv_synced);

    // The delete was attempted, failed, and the orphan stays for TTL expiry.
    assert!(journal
        .entries()
        .iter()
        .any(|e| e == &format!("blob.delete {}", old_key)));
    assert!(blob.contains(old_key));
}

#[tokio::test]
async fn unparsable_prior_record_is_left_alone() {
    let journal = OpJournal::new();
    let blob = MemBlobStore::new(journal.clone());
    let kv = MemKvStore::new(journal.clone());
    kv.seed(&kv_key(), "not json at all");

    let outcome = run_sync(&blob, &kv).await;
    assert!(outcome.r2_synced);
    assert!(outcome.kv_synced);
    assert!(journal.entries().iter().all(|e| !e.starts_with("blob.delete")));
}

#[tokio::test]
async fn unparsable_final_url_syncs_nothing() {
    let journal = OpJournal::new();
    let blob = MemBlobStore::new(journal.clone());
    let kv = MemKvStore::new(journal.clone());

    let analysis = seo::analyze(HTML, 200, FINAL_URL, None);
    let outcome = sync_rendered_page(
        &blob,
        &kv,
        TARGET,
        "::not-a-url::",
        HTML,
        &analysis,
        &settings(),
    )
    .await;

    assert!(!outcome.r2_synced);
    assert!(!outcome.kv_synced);
    assert!(journal.entries().is_empty());
}

#[tokio::test]
async fn successive_publishes_use_distinct_object_keys() {
    let journal = OpJournal::new();
    let blob = MemBlobStore::new(journal.clone());
    let kv = MemKvStore::new(journal.clone());

    run_sync(&blob, &kv).await;
    let first: IndexRecord = serde_json::from_str(&kv.value(&kv_key()).unwrap()).unwrap();

    // The object key timestamp has millisecond resolution.
    std::thread::sleep(std::time::Duration::from_millis(5));

    run_sync(&blob, &kv).await;
    let second: IndexRecord = serde_json::from_str(&kv.value(&kv_key()).unwrap()).unwrap();

    assert_ne!(first.object_key, second.object_key);
    // The second publish garbage-collected the first blob.
    assert!(!blob.contains(&first.object_key));
    assert!(blob.contains(&second.object_key));
}

#[test]
fn object_key_derivation_is_millisecond_unique() {
    let url = Url::parse(FINAL_URL).unwrap();
    let digest = sha256_hex(HTML);
    let t1 = Utc::now();
    let t2 = t1 + chrono::Duration::milliseconds(1);
    assert_ne!(
        build_object_key(&url, &digest, t1).unwrap(),
        build_object_key(&url, &digest, t2).unwrap()
    );
}
