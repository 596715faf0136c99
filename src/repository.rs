//! Marker repository - translates domain operations into store statements
//!
//! Nothing else in the crate builds SQL for markers or images. The repository
//! holds no cached state; every read goes to the store.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use rusqlite::types::{Type, Value};

use crate::marker::{self, Coordinate, Image, Marker, MarkerUpdate, NewImage, NewMarker};
use crate::storage::{Statement, Store, StoreResult};

const MARKER_COLUMNS: &str = "id, latitude, longitude, title, description, created_at, updated_at";
const IMAGE_COLUMNS: &str = "id, uri, name, date_added, size, type";
const INSERT_IMAGE: &str =
    "INSERT INTO images (id, marker_id, uri, name, date_added, size, type) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)";

/// Durable marker operations. Every write has committed when the future resolves.
#[async_trait]
pub trait MarkerRepo: Send + Sync {
    /// Make sure the underlying store is open and migrated
    async fn initialize(&self) -> StoreResult<()>;

    /// Insert a marker and return its new id. Fields are stored as given.
    async fn create_marker(&self, data: &NewMarker) -> StoreResult<String>;

    /// All markers, newest first, each with its images oldest first
    async fn get_all_markers(&self) -> StoreResult<Vec<Marker>>;

    /// Apply a title/description edit and stamp `updated_at`
    async fn update_marker(&self, id: &str, update: &MarkerUpdate) -> StoreResult<()>;

    /// Delete a marker and all of its images atomically
    async fn delete_marker(&self, id: &str) -> StoreResult<()>;

    async fn add_image_to_marker(&self, marker_id: &str, image: &NewImage) -> StoreResult<String>;

    async fn remove_image_from_marker(&self, image_id: &str) -> StoreResult<()>;

    /// Images of one marker, oldest first
    async fn get_marker_images(&self, marker_id: &str) -> StoreResult<Vec<Image>>;
}

/// SQLite-backed [`MarkerRepo`]
#[derive(Clone)]
pub struct MarkerRepository {
    store: Arc<Store>,
}

impl MarkerRepository {
    pub fn new(store: Arc<Store>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    /// Get database statistics
    pub async fn stats(&self) -> StoreResult<DbStats> {
        Ok(DbStats {
            markers: self.count("markers").await?,
            images: self.count("images").await?,
            schema_version: self.store.schema_version().await?,
        })
    }

    async fn count(&self, table: &str) -> StoreResult<usize> {
        let sql = format!("SELECT COUNT(*) FROM {}", table);
        let rows: Vec<i64> = self.store.execute_query(&sql, &[], |row| row.get(0)).await?;
        Ok(rows.into_iter().next().unwrap_or(0) as usize)
    }

    /// Helper to convert a row to a Marker (images are filled in separately)
    fn row_to_marker(row: &rusqlite::Row) -> rusqlite::Result<Marker> {
        let created_at: String = row.get(5)?;
        let updated_at: Option<String> = row.get(6)?;

        Ok(Marker {
            id: row.get(0)?,
            coordinate: Coordinate::new(row.get(1)?, row.get(2)?),
            title: row.get(3)?,
            description: row.get(4)?,
            images: Vec::new(),
            created_at: parse_column(5, &created_at)?,
            updated_at: updated_at.map(|ts| parse_column(6, &ts)).transpose()?,
        })
    }

    /// Helper to convert a row to an Image
    fn row_to_image(row: &rusqlite::Row) -> rusqlite::Result<Image> {
        let date_added: String = row.get(3)?;
        let size: Option<i64> = row.get(4)?;

        Ok(Image {
            id: row.get(0)?,
            uri: row.get(1)?,
            name: row.get(2)?,
            date_added: parse_column(3, &date_added)?,
            size: size.and_then(|s| u64::try_from(s).ok()),
            mime_type: row.get(5)?,
        })
    }
}

#[async_trait]
impl MarkerRepo for MarkerRepository {
    async fn initialize(&self) -> StoreResult<()> {
        self.store.initialize().await
    }

    async fn create_marker(&self, data: &NewMarker) -> StoreResult<String> {
        let id = marker::new_id();
        let now = marker::format_timestamp(&Utc::now());

        let insert = Statement::new(
            format!(
                "INSERT INTO markers ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, NULL)",
                MARKER_COLUMNS
            ),
            vec![
                text(&id),
                Value::Real(data.coordinate.latitude),
                Value::Real(data.coordinate.longitude),
                text(data.title.as_deref().unwrap_or_default()),
                text(data.description.as_deref().unwrap_or_default()),
                text(now),
            ],
        );
        self.store.execute_transaction(&[insert]).await?;

        tracing::debug!("Created marker {}", id);
        Ok(id)
    }

    async fn get_all_markers(&self) -> StoreResult<Vec<Marker>> {
        let sql = format!(
            "SELECT {} FROM markers ORDER BY created_at DESC, rowid DESC",
            MARKER_COLUMNS
        );
        let mut markers = self.store.execute_query(&sql, &[], Self::row_to_marker).await?;

        // One follow-up read per marker; marker counts stay small.
        for marker in &mut markers {
            marker.images = self.get_marker_images(&marker.id).await?;
        }

        tracing::debug!("Loaded {} markers", markers.len());
        Ok(markers)
    }

    async fn update_marker(&self, id: &str, update: &MarkerUpdate) -> StoreResult<()> {
        if update.is_empty() {
            return Ok(());
        }

        let mut assignments = Vec::new();
        let mut args = Vec::new();
        if let Some(title) = &update.title {
            args.push(text(title));
            assignments.push(format!("title = ?{}", args.len()));
        }
        if let Some(description) = &update.description {
            args.push(text(description));
            assignments.push(format!("description = ?{}", args.len()));
        }
        args.push(text(marker::format_timestamp(&Utc::now())));
        assignments.push(format!("updated_at = ?{}", args.len()));
        args.push(text(id));

        let sql = format!(
            "UPDATE markers SET {} WHERE id = ?{}",
            assignments.join(", "),
            args.len()
        );
        self.store.execute_transaction(&[Statement::new(sql, args)]).await
    }

    async fn delete_marker(&self, id: &str) -> StoreResult<()> {
        // Explicit cascade; the schema's ON DELETE CASCADE covers the same rows.
        let statements = [
            Statement::new("DELETE FROM images WHERE marker_id = ?1", vec![text(id)]),
            Statement::new("DELETE FROM markers WHERE id = ?1", vec![text(id)]),
        ];
        self.store.execute_transaction(&statements).await?;

        tracing::debug!("Deleted marker {}", id);
        Ok(())
    }

    async fn add_image_to_marker(&self, marker_id: &str, image: &NewImage) -> StoreResult<String> {
        let id = marker::new_id();
        let args = vec![
            text(&id),
            text(marker_id),
            text(&image.uri),
            text(&image.name),
            text(marker::format_timestamp(&image.date_added)),
            image
                .size
                .map_or(Value::Null, |size| Value::Integer(i64::try_from(size).unwrap_or(i64::MAX))),
            image.mime_type.as_deref().map_or(Value::Null, text),
        ];
        self.store.execute_mutation(INSERT_IMAGE, &args).await?;

        tracing::debug!("Attached image {} to marker {}", id, marker_id);
        Ok(id)
    }

    async fn remove_image_from_marker(&self, image_id: &str) -> StoreResult<()> {
        self.store
            .execute_mutation("DELETE FROM images WHERE id = ?1", &[text(image_id)])
            .await?;
        Ok(())
    }

    async fn get_marker_images(&self, marker_id: &str) -> StoreResult<Vec<Image>> {
        let sql = format!(
            "SELECT {} FROM images WHERE marker_id = ?1 ORDER BY date_added ASC, rowid ASC",
            IMAGE_COLUMNS
        );
        self.store
            .execute_query(&sql, &[text(marker_id)], Self::row_to_image)
            .await
    }
}

fn text(s: impl AsRef<str>) -> Value {
    Value::Text(s.as_ref().to_string())
}

fn parse_column(idx: usize, raw: &str) -> rusqlite::Result<chrono::DateTime<Utc>> {
    marker::parse_timestamp(raw)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

/// Database statistics
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct DbStats {
    pub markers: usize,
    pub images: usize,
    pub schema_version: u32,
}

impl std::fmt::Display for DbStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Database Statistics:")?;
        writeln!(f, "  Markers: {}", self.markers)?;
        writeln!(f, "  Images: {}", self.images)?;
        writeln!(f, "  Schema version: {}", self.schema_version)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{StoreConfig, StoreError};
    use chrono::TimeZone;
    use std::time::Duration;

    fn repo() -> MarkerRepository {
        let config = StoreConfig {
            retry_base_delay: Duration::from_millis(1),
            ..StoreConfig::default()
        };
        MarkerRepository::new(Arc::new(Store::open_in_memory(config)))
    }

    fn at(secs: i64) -> chrono::DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    async fn images_referencing(repo: &MarkerRepository, marker_id: &str) -> i64 {
        let rows: Vec<i64> = repo
            .store()
            .execute_query(
                "SELECT COUNT(*) FROM images WHERE marker_id = ?1",
                &[text(marker_id)],
                |row| row.get(0),
            )
            .await
            .unwrap();
        rows[0]
    }

    #[tokio::test]
    async fn test_create_and_list() {
        let repo = repo();
        let id = repo
            .create_marker(&NewMarker::new(Coordinate::new(58.0048, 56.2082)).with_title("Home"))
            .await
            .unwrap();

        let markers = repo.get_all_markers().await.unwrap();
        assert_eq!(markers.len(), 1);
        assert_eq!(markers[0].id, id);
        assert_eq!(markers[0].coordinate, Coordinate::new(58.0048, 56.2082));
        assert_eq!(markers[0].title, "Home");
        assert_eq!(markers[0].description, "");
        assert!(markers[0].images.is_empty());
        assert!(markers[0].updated_at.is_none());
    }

    #[tokio::test]
    async fn test_markers_newest_first() {
        let repo = repo();
        let first = repo.create_marker(&NewMarker::new(Coordinate::new(1.0, 1.0))).await.unwrap();
        let second = repo.create_marker(&NewMarker::new(Coordinate::new(2.0, 2.0))).await.unwrap();

        let ids: Vec<String> = repo
            .get_all_markers()
            .await
            .unwrap()
            .into_iter()
            .map(|m| m.id)
            .collect();
        assert_eq!(ids, vec![second, first]);
    }

    #[tokio::test]
    async fn test_images_oldest_first() {
        let repo = repo();
        let marker_id = repo.create_marker(&NewMarker::new(Coordinate::new(0.0, 0.0))).await.unwrap();

        let late = NewImage::new("file://late.jpg", "late.jpg").added_at(at(60));
        let early = NewImage::new("file://early.jpg", "early.jpg")
            .added_at(at(0))
            .with_size(2048)
            .with_mime_type("image/jpeg");
        repo.add_image_to_marker(&marker_id, &late).await.unwrap();
        repo.add_image_to_marker(&marker_id, &early).await.unwrap();

        let images = repo.get_marker_images(&marker_id).await.unwrap();
        assert_eq!(images.len(), 2);
        assert_eq!(images[0].uri, "file://early.jpg");
        assert_eq!(images[0].size, Some(2048));
        assert_eq!(images[0].mime_type.as_deref(), Some("image/jpeg"));
        assert_eq!(images[0].date_added, at(0));
        assert_eq!(images[1].uri, "file://late.jpg");
        assert_eq!(images[1].size, None);

        let markers = repo.get_all_markers().await.unwrap();
        assert_eq!(markers[0].images, images);
    }

    #[tokio::test]
    async fn test_delete_cascades_for_any_image_count() {
        let repo = repo();
        for image_count in [0usize, 1, 3] {
            let marker_id = repo.create_marker(&NewMarker::new(Coordinate::new(0.0, 0.0))).await.unwrap();
            for i in 0..image_count {
                let image = NewImage::new(format!("file://{i}.jpg"), format!("{i}.jpg"));
                repo.add_image_to_marker(&marker_id, &image).await.unwrap();
            }
            assert_eq!(images_referencing(&repo, &marker_id).await, image_count as i64);

            repo.delete_marker(&marker_id).await.unwrap();
            assert_eq!(images_referencing(&repo, &marker_id).await, 0);
        }
        assert!(repo.get_all_markers().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_delete_keeps_other_markers() {
        let repo = repo();
        let keep = repo.create_marker(&NewMarker::new(Coordinate::new(1.0, 1.0))).await.unwrap();
        let drop_id = repo.create_marker(&NewMarker::new(Coordinate::new(2.0, 2.0))).await.unwrap();
        repo.add_image_to_marker(&keep, &NewImage::new("file://k.jpg", "k.jpg")).await.unwrap();
        repo.add_image_to_marker(&drop_id, &NewImage::new("file://d.jpg", "d.jpg")).await.unwrap();

        repo.delete_marker(&drop_id).await.unwrap();

        let markers = repo.get_all_markers().await.unwrap();
        assert_eq!(markers.len(), 1);
        assert_eq!(markers[0].id, keep);
        assert_eq!(markers[0].images.len(), 1);
    }

    #[tokio::test]
    async fn test_remove_single_image() {
        let repo = repo();
        let marker_id = repo.create_marker(&NewMarker::new(Coordinate::new(0.0, 0.0))).await.unwrap();
        let a = repo.add_image_to_marker(&marker_id, &NewImage::new("file://a.jpg", "a.jpg").added_at(at(0))).await.unwrap();
        let b = repo.add_image_to_marker(&marker_id, &NewImage::new("file://b.jpg", "b.jpg").added_at(at(1))).await.unwrap();

        repo.remove_image_from_marker(&a).await.unwrap();

        let images = repo.get_marker_images(&marker_id).await.unwrap();
        assert_eq!(images.len(), 1);
        assert_eq!(images[0].id, b);
    }

    #[tokio::test]
    async fn test_update_marker_stamps_updated_at() {
        let repo = repo();
        let id = repo
            .create_marker(&NewMarker::new(Coordinate::new(0.0, 0.0)).with_title("Old").with_description("Keep"))
            .await
            .unwrap();

        let update = MarkerUpdate {
            title: Some("New".to_string()),
            description: None,
        };
        repo.update_marker(&id, &update).await.unwrap();

        let marker = repo.get_all_markers().await.unwrap().remove(0);
        assert_eq!(marker.title, "New");
        assert_eq!(marker.description, "Keep");
        let updated_at = marker.updated_at.unwrap();
        assert!(updated_at >= marker.created_at);
    }

    #[tokio::test]
    async fn test_image_for_missing_marker_is_rejected() {
        let repo = repo();
        let err = repo
            .add_image_to_marker("nope", &NewImage::new("file://x.jpg", "x.jpg"))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::MutationFailed { .. }));
    }

    #[tokio::test]
    async fn test_stats() {
        let repo = repo();
        let id = repo.create_marker(&NewMarker::new(Coordinate::new(0.0, 0.0))).await.unwrap();
        repo.add_image_to_marker(&id, &NewImage::new("file://x.jpg", "x.jpg")).await.unwrap();

        let stats = repo.stats().await.unwrap();
        assert_eq!(stats.markers, 1);
        assert_eq!(stats.images, 1);
        assert_eq!(stats.schema_version, crate::storage::schema::latest_version());
    }
}
