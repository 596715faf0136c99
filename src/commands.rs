use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context as _;
use async_trait::async_trait;
use owo_colors::OwoColorize;

use maplab::config::{self, MaplabConfig};
use maplab::marker::format_timestamp;
use maplab::proximity::ProximityTracker;
use maplab::ui::{self, Icons};
use maplab::{
    Coordinate, ImagePicker, Marker, MarkerCache, MarkerRepository, MarkerUpdate, NewMarker,
    PickOutcome, PickedImage, Store,
};

use crate::{command_name, emit_success, Cli, Commands, OutputMode};

/// Everything one command needs: config, repository and an initialized cache
struct Session {
    config: MaplabConfig,
    database: PathBuf,
    repo: Arc<MarkerRepository>,
    cache: MarkerCache,
}

impl Session {
    async fn open(cli: &Cli, config: MaplabConfig) -> anyhow::Result<Self> {
        let database = cli.database.clone().unwrap_or_else(|| config.database_path());
        config::ensure_db_dir(&database)?;
        tracing::debug!("Opening database {}", database.display());

        let store = Arc::new(Store::open(&database, config.store_config()));
        let repo = Arc::new(MarkerRepository::new(store));
        let cache = MarkerCache::with_defaults(repo.clone(), config.marker_defaults());
        if !cache.initialize().await {
            return Err(failure(&cache));
        }

        Ok(Self {
            config,
            database,
            repo,
            cache,
        })
    }

    fn marker(&self, id: &str) -> anyhow::Result<Marker> {
        self.cache
            .get_marker(id)
            .ok_or_else(|| domain_error(&maplab::Error::MarkerNotFound(id.to_string())))
    }
}

/// The error the cache recorded for the last failed operation
fn failure(cache: &MarkerCache) -> anyhow::Error {
    match cache.error() {
        Some(e) => domain_error(&e),
        None => anyhow::anyhow!("Operation did not complete"),
    }
}

/// Banner text on top, full error underneath for `{:#}`
fn domain_error(e: &maplab::Error) -> anyhow::Error {
    anyhow::anyhow!("{}", e).context(e.user_message())
}

pub async fn run(cli: &Cli) -> anyhow::Result<()> {
    let mode = cli.format;

    if let Commands::Init { force } = &cli.command {
        return run_init(cli, *force).await;
    }

    let config = config::load_config(Some(&cli.config))?.unwrap_or_default();
    let session = Session::open(cli, config).await?;
    let command = command_name(&cli.command);

    match &cli.command {
        Commands::Init { .. } => Ok(()),

        Commands::Add {
            lat,
            lon,
            title,
            description,
        } => {
            let data = NewMarker {
                coordinate: Coordinate::new(*lat, *lon),
                title: title.clone(),
                description: description.clone(),
            };
            let id = session
                .cache
                .add_marker(data)
                .await
                .ok_or_else(|| failure(&session.cache))?;
            let marker = session.marker(&id)?;

            if mode.is_human() {
                ui::success("Marker added");
                ui::marker_line(&marker);
            } else {
                emit_success(command, serde_json::to_value(&marker)?)?;
            }
            Ok(())
        }

        Commands::List => {
            let markers = session.cache.markers();
            if !mode.is_human() {
                return emit_success(command, serde_json::to_value(&markers)?);
            }

            if markers.is_empty() {
                ui::info("Markers", "none yet (add one with `maplab add`)");
            } else {
                println!("{}", ui::marker_table(&markers));
                ui::summary_row("Total:", &markers.len().to_string());
            }
            Ok(())
        }

        Commands::Show { id } => {
            let marker = session.marker(id)?;
            if mode.is_human() {
                print_marker(&marker);
            } else {
                emit_success(command, serde_json::to_value(&marker)?)?;
            }
            Ok(())
        }

        Commands::Edit {
            id,
            title,
            description,
        } => {
            let update = MarkerUpdate {
                title: title.clone(),
                description: description.clone(),
            };
            if update.is_empty() {
                anyhow::bail!("Nothing to change (use --title or --description)");
            }
            if !session.cache.update_marker(id, update).await {
                return Err(failure(&session.cache));
            }

            let marker = session.marker(id)?;
            if mode.is_human() {
                ui::changed(Icons::EDIT, "Marker updated");
                ui::marker_line(&marker);
            } else {
                emit_success(command, serde_json::to_value(&marker)?)?;
            }
            Ok(())
        }

        Commands::Remove { id } => {
            let images = session.cache.get_marker(id).map(|m| m.images.len()).unwrap_or(0);
            if !session.cache.remove_marker(id).await {
                return Err(failure(&session.cache));
            }

            if mode.is_human() {
                ui::changed(Icons::DEL, &format!("Removed marker {} ({} images)", id, images));
            } else {
                emit_success(command, serde_json::json!({ "id": id, "images_removed": images }))?;
            }
            Ok(())
        }

        Commands::Attach {
            marker_id,
            uri,
            name,
            mime,
        } => {
            let picker = CliPicker {
                uri: uri.clone(),
                name: name.clone(),
                mime: mime.clone(),
            };
            let intake = session.config.image_intake();
            if !session
                .cache
                .pick_and_attach_image(marker_id, &intake, &picker)
                .await
            {
                return Err(failure(&session.cache));
            }

            let marker = session.marker(marker_id)?;
            if mode.is_human() {
                ui::success(&format!("Image attached to {}", marker.title));
                for image in &marker.images {
                    ui::image_line(image);
                }
            } else {
                emit_success(command, serde_json::to_value(&marker)?)?;
            }
            Ok(())
        }

        Commands::Detach { marker_id, image_id } => {
            let marker = session.marker(marker_id)?;
            if marker.image(image_id).is_none() {
                anyhow::bail!("Image {} is not attached to marker {}", image_id, marker_id);
            }
            if !session.cache.detach_image(marker_id, image_id).await {
                return Err(failure(&session.cache));
            }

            if mode.is_human() {
                ui::success(&format!("Image {} detached", image_id));
            } else {
                emit_success(command, serde_json::json!({ "marker_id": marker_id, "image_id": image_id }))?;
            }
            Ok(())
        }

        Commands::Nearby { lat, lon, radius } => {
            let here = Coordinate::new(*lat, *lon);
            here.validate().map_err(anyhow::Error::msg)?;

            let threshold = radius.unwrap_or(session.config.proximity.threshold_meters);
            let tracker = ProximityTracker::new(threshold);
            let markers = session.cache.markers();
            let found = tracker.nearby(&here, &markers);

            if !mode.is_human() {
                let data: Vec<_> = found
                    .iter()
                    .map(|(marker, distance)| {
                        serde_json::json!({
                            "id": marker.id,
                            "title": marker.title,
                            "distance_m": distance,
                        })
                    })
                    .collect();
                return emit_success(command, serde_json::Value::Array(data));
            }

            ui::status(Icons::RADAR, "Within", &format!("{:.0} m of {}", threshold, here));
            if found.is_empty() {
                println!("  {}", ui::muted("No markers nearby"));
            } else {
                println!("{}", ui::nearby_table(&found));
            }
            Ok(())
        }

        Commands::Stats => {
            let stats = session.repo.stats().await?;
            if !mode.is_human() {
                return emit_success(command, serde_json::to_value(&stats)?);
            }

            let markers = stats.markers.to_string();
            let images = stats.images.to_string();
            let version = stats.schema_version.to_string();

            ui::header("Maplab");
            ui::status(Icons::DATABASE, "Database", &session.database.display().to_string());
            println!(
                "{}",
                ui::stats_table(&[
                    ("Markers", markers.as_str()),
                    ("Images", images.as_str()),
                    ("Schema version", version.as_str()),
                ])
            );
            Ok(())
        }
    }
}

async fn run_init(cli: &Cli, force: bool) -> anyhow::Result<()> {
    let existing = if force {
        None
    } else {
        config::load_config(Some(&cli.config))?
    };

    let (config, wrote) = match existing {
        Some(config) => (config, false),
        None => {
            let config = MaplabConfig::default();
            config::write_config(&cli.config, &config, force)?;
            (config, true)
        }
    };

    let session = Session::open(cli, config).await?;
    let stats = session.repo.stats().await?;

    if cli.format == OutputMode::Json {
        return emit_success(
            "init",
            serde_json::json!({
                "config": cli.config.display().to_string(),
                "config_written": wrote,
                "database": session.database.display().to_string(),
                "schema_version": stats.schema_version,
            }),
        );
    }

    ui::header("Maplab initialized");
    if wrote {
        ui::status(Icons::NEW, "Config", &cli.config.display().to_string());
    } else {
        ui::status(Icons::GEAR, "Config", &format!("{} (existing)", cli.config.display()));
    }
    ui::status(Icons::DATABASE, "Database", &session.database.display().to_string());
    ui::summary_row("Schema version:", &stats.schema_version.to_string());
    ui::summary_row("Markers:", &stats.markers.to_string());
    Ok(())
}

fn print_marker(marker: &Marker) {
    ui::marker_line(marker);
    ui::info("Description", &marker.description);
    ui::info("Created", &format_timestamp(&marker.created_at));
    if let Some(updated_at) = &marker.updated_at {
        ui::info("Updated", &format_timestamp(updated_at));
    }

    ui::section(&format!(" Images ({}) ", marker.images.len()));
    if marker.images.is_empty() {
        println!("  {}", "none".style(ui::theme().muted));
    } else {
        println!("{}", ui::image_table(&marker.images));
    }
}

/// Picker backed by command-line arguments. Local files are checked and
/// sized; other URIs are passed through as given.
struct CliPicker {
    uri: String,
    name: Option<String>,
    mime: Option<String>,
}

#[async_trait]
impl ImagePicker for CliPicker {
    async fn request_permission(&self) -> bool {
        match local_path(&self.uri) {
            Some(path) => !matches!(
                std::fs::File::open(&path),
                Err(e) if e.kind() == std::io::ErrorKind::PermissionDenied
            ),
            None => true,
        }
    }

    async fn pick(&self) -> anyhow::Result<PickOutcome> {
        let (uri, byte_size) = match local_path(&self.uri) {
            Some(path) => {
                let path = std::fs::canonicalize(&path)
                    .with_context(|| format!("cannot open {}", path.display()))?;
                let metadata = std::fs::metadata(&path)?;
                if !metadata.is_file() {
                    anyhow::bail!("{} is not a file", path.display());
                }
                (format!("file://{}", path.display()), Some(metadata.len()))
            }
            None => (self.uri.clone(), None),
        };

        Ok(PickOutcome::Picked(PickedImage {
            display_name: self.name.clone().or_else(|| file_name(&uri)),
            mime_type: self.mime.clone().or_else(|| guess_mime(&uri).map(str::to_string)),
            uri,
            byte_size,
        }))
    }
}

/// `file://` URIs and plain paths are local; anything with another scheme is not
fn local_path(uri: &str) -> Option<PathBuf> {
    if let Some(path) = uri.strip_prefix("file://") {
        return Some(PathBuf::from(path));
    }
    if uri.contains("://") {
        return None;
    }
    Some(PathBuf::from(uri))
}

fn file_name(uri: &str) -> Option<String> {
    let last = uri.rsplit('/').next()?;
    if last.is_empty() {
        return None;
    }
    Some(last.to_string())
}

fn guess_mime(uri: &str) -> Option<&'static str> {
    let ext = Path::new(uri).extension()?.to_str()?.to_ascii_lowercase();
    match ext.as_str() {
        "jpg" | "jpeg" => Some("image/jpeg"),
        "png" => Some("image/png"),
        "gif" => Some("image/gif"),
        "webp" => Some("image/webp"),
        "heic" => Some("image/heic"),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_local_path() {
        assert_eq!(local_path("file:///tmp/a.jpg"), Some(PathBuf::from("/tmp/a.jpg")));
        assert_eq!(local_path("photos/a.jpg"), Some(PathBuf::from("photos/a.jpg")));
        assert_eq!(local_path("content://media/42"), None);
    }

    #[test]
    fn test_domain_error_banner_keeps_detail() {
        let err = domain_error(&maplab::Error::MarkerNotFound("m1".to_string()));
        assert_eq!(err.to_string(), "Marker not found");
        assert_eq!(format!("{:#}", err), "Marker not found: Marker not found: m1");

        let err = domain_error(&maplab::Error::MarkerAddFailed(maplab::Cause::Message(
            "disk full".to_string(),
        )));
        assert_eq!(err.to_string(), "Could not add the marker");
        assert!(format!("{:#}", err).ends_with("Failed to add marker: disk full"));
    }

    #[test]
    fn test_guess_mime() {
        assert_eq!(guess_mime("file:///a.JPG"), Some("image/jpeg"));
        assert_eq!(guess_mime("b.png"), Some("image/png"));
        assert_eq!(guess_mime("notes.txt"), None);
    }

    #[tokio::test]
    async fn test_cli_picker_sizes_local_files() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("a.jpg");
        std::fs::write(&path, vec![0u8; 2048]).unwrap();

        let picker = CliPicker {
            uri: path.display().to_string(),
            name: None,
            mime: None,
        };
        assert!(picker.request_permission().await);

        let PickOutcome::Picked(picked) = picker.pick().await.unwrap() else {
            panic!("expected a picked image");
        };
        assert!(picked.uri.starts_with("file://"));
        assert_eq!(picked.byte_size, Some(2048));
        assert_eq!(picked.display_name.as_deref(), Some("a.jpg"));
        assert_eq!(picked.mime_type.as_deref(), Some("image/jpeg"));
    }

    #[tokio::test]
    async fn test_cli_picker_missing_file_fails() {
        let dir = tempdir().unwrap();
        let picker = CliPicker {
            uri: dir.path().join("missing.jpg").display().to_string(),
            name: None,
            mime: None,
        };
        assert!(picker.pick().await.is_err());
    }
}
