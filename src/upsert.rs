use crate::model::Changeset;
use chrono::{DateTime, Utc};
use eyre::{Result, WrapErr};
use sqlx::{PgConnection, PgPool};
use std::collections::{BTreeMap, HashSet};

/// Result of writing one batch.
#[derive(Debug, Default, Clone, Copy)]
pub struct UpsertOutcome {
    /// Records handed in (after in-batch dedup).
    pub total: usize,
    /// Rows that did not exist before this batch.
    pub inserted: usize,
    /// Rows the statement actually touched (inserts + updates that passed
    /// the reconciliation predicates).
    pub applied: u64,
}

/// The reconciling multi-row upsert. One transaction per batch; the
/// open/closed and comment-append rules are encoded in the UPDATE so a replay
/// can never regress a row or duplicate comments:
///
/// - a closed row is never overwritten by an open version of itself;
/// - a snapshot with fewer comments than the stored row is skipped;
/// - comments append only when the incoming list is non-empty and the stored
///   count is strictly lower; tags are replaced.
const UPSERT_SQL: &str = r#"
INSERT INTO changesets AS c
    (id, username, uid, created_at, closed_at, open, num_changes, comments_count,
     min_lon, min_lat, max_lon, max_lat, bbox, tags, comments)
SELECT
    t.id, t.username, t.uid, t.created_at, t.closed_at, t.open, t.num_changes, t.comments_count,
    t.min_lon, t.min_lat, t.max_lon, t.max_lat,
    CASE WHEN t.bbox_wkt IS NOT NULL THEN ST_GeomFromText(t.bbox_wkt, 4326) END,
    t.tags::jsonb, t.comments::jsonb
FROM UNNEST(
    $1::bigint[], $2::text[], $3::bigint[], $4::timestamptz[], $5::timestamptz[],
    $6::boolean[], $7::integer[], $8::integer[],
    $9::double precision[], $10::double precision[], $11::double precision[], $12::double precision[],
    $13::text[], $14::text[], $15::text[]
) AS t(id, username, uid, created_at, closed_at, open, num_changes, comments_count,
       min_lon, min_lat, max_lon, max_lat, bbox_wkt, tags, comments)
ON CONFLICT (id) DO UPDATE SET
    username = EXCLUDED.username,
    uid = EXCLUDED.uid,
    created_at = EXCLUDED.created_at,
    closed_at = COALESCE(EXCLUDED.closed_at, c.closed_at),
    open = c.open AND EXCLUDED.open,
    num_changes = EXCLUDED.num_changes,
    comments_count = EXCLUDED.comments_count,
    min_lon = EXCLUDED.min_lon,
    min_lat = EXCLUDED.min_lat,
    max_lon = EXCLUDED.max_lon,
    max_lat = EXCLUDED.max_lat,
    bbox = EXCLUDED.bbox,
    tags = EXCLUDED.tags,
    comments = CASE
        WHEN jsonb_array_length(EXCLUDED.comments) > 0
             AND c.comments_count < EXCLUDED.comments_count
        THEN c.comments || EXCLUDED.comments
        ELSE c.comments
    END
WHERE NOT (c.closed_at IS NOT NULL AND EXCLUDED.closed_at IS NULL)
  AND c.comments_count <= EXCLUDED.comments_count
"#;

/// Write a batch of parsed changesets, reconciling against existing rows.
/// Rolls back the whole batch on any error.
pub async fn upsert_changesets(pool: &PgPool, batch: &[Changeset]) -> Result<UpsertOutcome> {
    let batch = dedupe_by_id(batch);
    if batch.is_empty() {
        return Ok(UpsertOutcome::default());
    }

    let ids: Vec<i64> = batch.iter().map(|cs| cs.id).collect();

    let mut tx = pool.begin().await.wrap_err("failed to open transaction")?;

    let existing = existing_ids(&mut tx, &ids).await?;
    let inserted = ids.iter().filter(|id| !existing.contains(id)).count();

    let mut usernames: Vec<Option<String>> = Vec::with_capacity(batch.len());
    let mut uids: Vec<i64> = Vec::with_capacity(batch.len());
    let mut created: Vec<DateTime<Utc>> = Vec::with_capacity(batch.len());
    let mut closed: Vec<Option<DateTime<Utc>>> = Vec::with_capacity(batch.len());
    let mut opens: Vec<bool> = Vec::with_capacity(batch.len());
    let mut num_changes: Vec<i32> = Vec::with_capacity(batch.len());
    let mut comment_counts: Vec<i32> = Vec::with_capacity(batch.len());
    let mut min_lons: Vec<Option<f64>> = Vec::with_capacity(batch.len());
    let mut min_lats: Vec<Option<f64>> = Vec::with_capacity(batch.len());
    let mut max_lons: Vec<Option<f64>> = Vec::with_capacity(batch.len());
    let mut max_lats: Vec<Option<f64>> = Vec::with_capacity(batch.len());
    let mut wkts: Vec<Option<String>> = Vec::with_capacity(batch.len());
    let mut tags: Vec<String> = Vec::with_capacity(batch.len());
    let mut comments: Vec<String> = Vec::with_capacity(batch.len());

    for cs in &batch {
        usernames.push(cs.username.clone());
        uids.push(cs.uid);
        created.push(cs.created_at);
        closed.push(cs.closed_at);
        opens.push(cs.open);
        num_changes.push(cs.num_changes);
        comment_counts.push(cs.comments_count);
        min_lons.push(cs.bbox.map(|b| b.min_lon));
        min_lats.push(cs.bbox.map(|b| b.min_lat));
        max_lons.push(cs.bbox.map(|b| b.max_lon));
        max_lats.push(cs.bbox.map(|b| b.max_lat));
        wkts.push(cs.bbox_wkt());
        tags.push(serde_json::to_string(&cs.tags).wrap_err("failed to encode tags")?);
        comments.push(serde_json::to_string(&cs.comments).wrap_err("failed to encode comments")?);
    }

    let result = sqlx::query(UPSERT_SQL)
        .bind(&ids)
        .bind(&usernames)
        .bind(&uids)
        .bind(&created)
        .bind(&closed)
        .bind(&opens)
        .bind(&num_changes)
        .bind(&comment_counts)
        .bind(&min_lons)
        .bind(&min_lats)
        .bind(&max_lons)
        .bind(&max_lats)
        .bind(&wkts)
        .bind(&tags)
        .bind(&comments)
        .execute(&mut *tx)
        .await
        .wrap_err("changeset batch upsert failed")?;

    tx.commit().await.wrap_err("failed to commit batch")?;

    Ok(UpsertOutcome {
        total: batch.len(),
        inserted,
        applied: result.rows_affected(),
    })
}

/// Ids from the batch that already have a row.
async fn existing_ids(conn: &mut PgConnection, ids: &[i64]) -> Result<HashSet<i64>> {
    let rows: Vec<i64> = sqlx::query_scalar("SELECT id FROM changesets WHERE id = ANY($1)")
        .bind(ids)
        .fetch_all(conn)
        .await
        .wrap_err("duplicate id lookup failed")?;
    Ok(rows.into_iter().collect())
}

/// A single multi-row INSERT cannot touch the same id twice; keep the last
/// occurrence, which is the later snapshot in document order.
fn dedupe_by_id(batch: &[Changeset]) -> Vec<Changeset> {
    let mut by_id: BTreeMap<i64, &Changeset> = BTreeMap::new();
    for cs in batch {
        by_id.insert(cs.id, cs);
    }
    by_id.into_values().cloned().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::parse_datetime;
    use std::collections::BTreeMap as Map;

    fn cs(id: i64, comments_count: i32) -> Changeset {
        Changeset {
            id,
            username: Some("mapper".to_string()),
            uid: 1,
            created_at: parse_datetime("2024-06-01T00:00:00Z").unwrap(),
            closed_at: None,
            open: true,
            num_changes: 0,
            comments_count,
            bbox: None,
            tags: Map::new(),
            comments: Vec::new(),
        }
    }

    #[test]
    fn dedupe_keeps_the_last_occurrence() {
        let batch = vec![cs(1, 0), cs(2, 0), cs(1, 5)];
        let deduped = dedupe_by_id(&batch);
        assert_eq!(deduped.len(), 2);
        let first = deduped.iter().find(|c| c.id == 1).unwrap();
        assert_eq!(first.comments_count, 5);
    }

    #[test]
    fn dedupe_preserves_unique_batches() {
        let batch = vec![cs(3, 0), cs(1, 0), cs(2, 0)];
        assert_eq!(dedupe_by_id(&batch).len(), 3);
    }
}
