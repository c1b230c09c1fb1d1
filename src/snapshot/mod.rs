//! Snapshot publisher: projects authoritative entities into the per-widget
//! snapshots the renderer reads.
//!
//! Building a snapshot is pure and happens outside any transaction; only the
//! final swap (read previous version, write `version + 1`) runs under the
//! store's write lock.

use std::collections::BTreeSet;

use anyhow::{Context, Result};
use rusqlite::Connection;

use crate::{
    db::{
        repositories::{entities, kv},
        Database, Namespace,
    },
    models::{
        EntityKind, Grouping, LedgerEntry, RenderConfig, Snapshot, SnapshotEntity, TrackedEntity, WidgetBinding,
    },
    reconcile::apply::apply_entry,
    utils::now_ms,
};

const ENABLE_LOGS: bool = true;

use crate::{log_debug, log_info, log_warn};

/// Pure projection. `entities` should be in the widget's configured order.
pub fn build_snapshot(
    widget_instance_id: &str,
    entities: &[TrackedEntity],
    config: &RenderConfig,
    version: u64,
    generated_at: i64,
) -> Snapshot {
    let mut views: Vec<SnapshotEntity> = entities.iter().map(SnapshotEntity::from_entity).collect();

    match config.grouping {
        Grouping::None => {}
        Grouping::ByKind => views.sort_by_key(|view| kind_rank(view)),
        Grouping::ByStatus => views.sort_by_key(|view| view.kind.is_complete()),
    }

    if !config.show_progress {
        for view in &mut views {
            view.progress = None;
        }
    }

    Snapshot {
        widget_instance_id: widget_instance_id.to_string(),
        version,
        generated_at,
        config: config.clone(),
        entities: views,
    }
}

fn kind_rank(view: &SnapshotEntity) -> u8 {
    match view.kind {
        EntityKind::CounterGoal { .. } => 0,
        EntityKind::TimerHabit { .. } => 1,
        EntityKind::HabitToggle { .. } => 2,
        EntityKind::TaskItem { .. } => 3,
    }
}

/// Write `snapshot` with a version one past whatever is stored.
pub fn swap_in(conn: &Connection, mut snapshot: Snapshot, now: i64) -> Result<Snapshot> {
    let key = Namespace::Snapshot.key(&snapshot.widget_instance_id);
    let previous: Option<Snapshot> = kv::get_json(conn, &key)?;
    snapshot.version = previous.map(|prev| prev.version).unwrap_or(0) + 1;
    kv::put_json(conn, &key, &snapshot, now)?;
    Ok(snapshot)
}

/// Rewrite one entity inside the stored snapshot of a widget in place and
/// bump the version. Returns `None` (and writes nothing) when the widget has
/// no snapshot or does not show `entity_id`.
pub fn patch_entity_in<F>(
    conn: &Connection,
    widget_instance_id: &str,
    entity_id: &str,
    now: i64,
    patch: F,
) -> Result<Option<Snapshot>>
where
    F: FnOnce(&mut EntityKind) -> Result<()>,
{
    let key = Namespace::Snapshot.key(widget_instance_id);
    let Some(mut snapshot) = kv::get_json::<Snapshot>(conn, &key)? else {
        return Ok(None);
    };
    let show_progress = snapshot.config.show_progress;
    let Some(view) = snapshot.entity_mut(entity_id) else {
        return Ok(None);
    };

    patch(&mut view.kind)?;
    view.refresh();
    if !show_progress {
        view.progress = None;
    }

    snapshot.version += 1;
    snapshot.generated_at = now;
    kv::put_json(conn, &key, &snapshot, now)?;
    Ok(Some(snapshot))
}

/// Fold each entity's pending ledger entry into the copy that gets rendered,
/// so a republish never hides a tap that has not been reconciled yet.
pub fn overlay_pending_in(conn: &Connection, entities: &mut [TrackedEntity], now: i64) -> Result<()> {
    for entity in entities.iter_mut() {
        let entry = match kv::get_json::<LedgerEntry>(conn, &Namespace::Ledger.key(&entity.id)) {
            Ok(Some(entry)) => entry,
            Ok(None) => continue,
            Err(err) => {
                log_warn!("Pending change for {} not shown: {err:#}", entity.id);
                continue;
            }
        };
        let mut shown = entity.clone();
        match apply_entry(&mut shown, &entry, now) {
            Ok(_) => *entity = shown,
            Err(err) => log_debug!("Pending change for {} not shown: {err}", entity.id),
        }
    }
    Ok(())
}

#[derive(Clone)]
pub struct SnapshotPublisher {
    db: Database,
}

impl SnapshotPublisher {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Idempotent: publishing the same entities twice yields the same content
    /// under a newer version.
    pub async fn publish(
        &self,
        widget_instance_id: &str,
        entities: Vec<TrackedEntity>,
        config: RenderConfig,
    ) -> Result<Snapshot> {
        let built = build_snapshot(widget_instance_id, &entities, &config, 0, now_ms());
        let snapshot = self
            .db
            .write(move |tx| swap_in(tx, built, now_ms()))
            .await
            .with_context(|| format!("failed to publish snapshot for {widget_instance_id}"))?;
        log_debug!(
            "Published snapshot v{} for widget {}",
            snapshot.version,
            widget_instance_id
        );
        Ok(snapshot)
    }

    /// Record a new widget instance and publish its first snapshot.
    pub async fn register_widget(&self, binding: WidgetBinding) -> Result<Snapshot> {
        let record = binding.clone();
        self.db
            .write(move |tx| {
                kv::put_json(
                    tx,
                    &Namespace::Widget.key(&record.widget_instance_id),
                    &record,
                    now_ms(),
                )
            })
            .await?;
        log_info!(
            "Registered widget {} with {} entit(ies)",
            binding.widget_instance_id,
            binding.entity_ids.len()
        );
        self.publish_binding(&binding).await
    }

    /// Delete the snapshot, binding and any persisted timer of a removed
    /// widget instance.
    pub async fn remove_widget(&self, widget_instance_id: &str) -> Result<()> {
        let id = widget_instance_id.to_string();
        self.db
            .write(move |tx| {
                kv::delete(tx, &Namespace::Snapshot.key(&id))?;
                kv::delete(tx, &Namespace::Widget.key(&id))?;
                kv::delete(tx, &Namespace::Timer.key(&id))?;
                Ok(())
            })
            .await?;
        log_info!("Removed widget {widget_instance_id}");
        Ok(())
    }

    pub async fn snapshot(&self, widget_instance_id: &str) -> Result<Option<Snapshot>> {
        self.db
            .get_record(Namespace::Snapshot, widget_instance_id)
            .await
    }

    pub async fn bindings(&self) -> Result<Vec<WidgetBinding>> {
        let records: Vec<(String, WidgetBinding)> = self.db.list_records(Namespace::Widget).await?;
        Ok(records.into_iter().map(|(_, binding)| binding).collect())
    }

    /// Republish every widget that shows at least one of `changed`.
    pub async fn republish_for(&self, changed: &BTreeSet<String>) -> Result<Vec<String>> {
        if changed.is_empty() {
            return Ok(Vec::new());
        }
        let affected: Vec<WidgetBinding> = self
            .bindings()
            .await?
            .into_iter()
            .filter(|binding| binding.shows_any(changed.iter()))
            .collect();
        self.publish_bindings(affected).await
    }

    pub async fn republish_all(&self) -> Result<Vec<String>> {
        let bindings = self.bindings().await?;
        self.publish_bindings(bindings).await
    }

    async fn publish_bindings(&self, bindings: Vec<WidgetBinding>) -> Result<Vec<String>> {
        let mut published = Vec::with_capacity(bindings.len());
        for binding in bindings {
            match self.publish_binding(&binding).await {
                Ok(_) => published.push(binding.widget_instance_id),
                Err(err) => log_warn!(
                    "Failed to republish widget {}: {err:?}",
                    binding.widget_instance_id
                ),
            }
        }
        Ok(published)
    }

    /// Authoritative rows plus pending changes. Read, overlay and swap share
    /// one transaction, so a widget patch cannot land in between and be
    /// overwritten.
    async fn publish_binding(&self, binding: &WidgetBinding) -> Result<Snapshot> {
        let record = binding.clone();
        let snapshot = self
            .db
            .write(move |tx| {
                let now = now_ms();
                let mut shown = entities::list_entities(tx, &record.entity_ids)?;
                overlay_pending_in(tx, &mut shown, now)?;
                let built = build_snapshot(&record.widget_instance_id, &shown, &record.config, 0, now);
                swap_in(tx, built, now)
            })
            .await
            .with_context(|| format!("failed to publish snapshot for {}", binding.widget_instance_id))?;
        log_debug!(
            "Published snapshot v{} for widget {}",
            snapshot.version,
            binding.widget_instance_id
        );
        Ok(snapshot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn sample_entities() -> Vec<TrackedEntity> {
        vec![
            TrackedEntity::task("t1", "Laundry", true, 0),
            TrackedEntity::counter("g1", "Water", 3.0, 10.0, 0),
            TrackedEntity::habit("h1", "Stretch", false, 0),
        ]
    }

    #[test]
    fn build_keeps_configured_order_without_grouping() {
        let snapshot = build_snapshot("w", &sample_entities(), &RenderConfig::default(), 1, 0);
        let ids: Vec<_> = snapshot.entities.iter().map(|e| e.id.as_str()).collect();
        assert_eq!(ids, vec!["t1", "g1", "h1"]);
    }

    #[test]
    fn status_grouping_puts_open_items_first() {
        let config = RenderConfig {
            grouping: Grouping::ByStatus,
            ..RenderConfig::default()
        };
        let snapshot = build_snapshot("w", &sample_entities(), &config, 1, 0);
        let ids: Vec<_> = snapshot.entities.iter().map(|e| e.id.as_str()).collect();
        assert_eq!(ids, vec!["g1", "h1", "t1"]);
    }

    #[test]
    fn kind_grouping_and_hidden_progress() {
        let config = RenderConfig {
            grouping: Grouping::ByKind,
            show_progress: false,
            ..RenderConfig::default()
        };
        let snapshot = build_snapshot("w", &sample_entities(), &config, 1, 0);
        assert_eq!(snapshot.entities[0].id, "g1");
        assert!(snapshot.entities.iter().all(|e| e.progress.is_none()));
    }

    #[tokio::test]
    async fn publish_bumps_version_each_time() {
        let tmp = TempDir::new().unwrap();
        let publisher = SnapshotPublisher::new(Database::new(tmp.path().join("s.sqlite3")).unwrap());

        let first = publisher
            .publish("w", sample_entities(), RenderConfig::default())
            .await
            .unwrap();
        let second = publisher
            .publish("w", sample_entities(), RenderConfig::default())
            .await
            .unwrap();

        assert_eq!(first.version, 1);
        assert_eq!(second.version, 2);
        assert_eq!(first.entities, second.entities);
    }

    #[tokio::test]
    async fn republish_only_touches_affected_widgets() {
        let tmp = TempDir::new().unwrap();
        let db = Database::new(tmp.path().join("s.sqlite3")).unwrap();
        for entity in sample_entities() {
            db.save_entity(&entity).await.unwrap();
        }
        let publisher = SnapshotPublisher::new(db);

        publisher
            .register_widget(WidgetBinding {
                widget_instance_id: "goals".into(),
                entity_ids: vec!["g1".into()],
                config: RenderConfig::default(),
            })
            .await
            .unwrap();
        publisher
            .register_widget(WidgetBinding {
                widget_instance_id: "todo".into(),
                entity_ids: vec!["t1".into(), "h1".into()],
                config: RenderConfig::default(),
            })
            .await
            .unwrap();

        let changed: BTreeSet<String> = ["g1".to_string()].into_iter().collect();
        let republished = publisher.republish_for(&changed).await.unwrap();
        assert_eq!(republished, vec!["goals".to_string()]);

        assert_eq!(publisher.snapshot("goals").await.unwrap().unwrap().version, 2);
        assert_eq!(publisher.snapshot("todo").await.unwrap().unwrap().version, 1);
    }

    #[tokio::test]
    async fn patching_an_entity_bumps_the_version() {
        let tmp = TempDir::new().unwrap();
        let db = Database::new(tmp.path().join("s.sqlite3")).unwrap();
        let publisher = SnapshotPublisher::new(db.clone());
        publisher
            .publish("w", sample_entities(), RenderConfig::default())
            .await
            .unwrap();

        let patched = db
            .write(|tx| {
                patch_entity_in(tx, "w", "g1", 5, |kind| {
                    if let EntityKind::CounterGoal { numeric_value, .. } = kind {
                        *numeric_value += 1.0;
                    }
                    Ok(())
                })
            })
            .await
            .unwrap()
            .unwrap();
        assert_eq!(patched.version, 2);
        assert_eq!(patched.entity("g1").unwrap().label, "4/10 (40%)");

        let missing = db
            .write(|tx| patch_entity_in(tx, "w", "nope", 6, |_| Ok(())))
            .await
            .unwrap();
        assert!(missing.is_none());
    }

    #[tokio::test]
    async fn republish_shows_changes_still_in_the_ledger() {
        let tmp = TempDir::new().unwrap();
        let db = Database::new(tmp.path().join("s.sqlite3")).unwrap();
        for entity in sample_entities() {
            db.save_entity(&entity).await.unwrap();
        }
        let publisher = SnapshotPublisher::new(db.clone());
        publisher
            .register_widget(WidgetBinding {
                widget_instance_id: "w".into(),
                entity_ids: vec!["g1".into(), "h1".into()],
                config: RenderConfig::default(),
            })
            .await
            .unwrap();

        let ledger = crate::ledger::Ledger::new(db);
        ledger
            .merge(crate::models::PendingChange::new(
                "g1",
                crate::models::ChangeKind::Delta { amount: 2.0 },
            ))
            .await
            .unwrap();

        publisher.republish_all().await.unwrap();
        let snapshot = publisher.snapshot("w").await.unwrap().unwrap();
        assert_eq!(snapshot.entity("g1").unwrap().label, "5/10 (50%)");
        assert_eq!(snapshot.entity("h1").unwrap().label, "Open");
        assert_eq!(ledger.peek("g1").await.unwrap().unwrap().net_delta(), 2.0);
    }

    #[tokio::test]
    async fn removing_a_widget_deletes_its_snapshot() {
        let tmp = TempDir::new().unwrap();
        let publisher = SnapshotPublisher::new(Database::new(tmp.path().join("s.sqlite3")).unwrap());
        publisher
            .register_widget(WidgetBinding {
                widget_instance_id: "w".into(),
                entity_ids: vec![],
                config: RenderConfig::default(),
            })
            .await
            .unwrap();

        publisher.remove_widget("w").await.unwrap();
        assert!(publisher.snapshot("w").await.unwrap().is_none());
        assert!(publisher.bindings().await.unwrap().is_empty());
    }
}
