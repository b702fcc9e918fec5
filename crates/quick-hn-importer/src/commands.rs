use crate::prompt::{AcceptAll, CliAttributeSelector, StdinConfirmer};
use crate::settings::{AttributeArgs, Command, ExtentArgs, Settings};
use anyhow::Context;
use quick_hn_lib::host::{HostHandles, MemoryHost};
use quick_hn_lib::source::ReqwestClient;
use quick_hn_lib::storage::FileStorage;
use quick_hn_lib::{
    Config, Confirmer, DatasetKind, DatasetStore, Feature, ImportResult, MatchOutcome, Session,
};
use serde_json::json;
use std::path::Path;
use std::sync::Arc;

/// Everything a command needs besides its own arguments
struct Runner {
    config: Config,
    settings: Settings,
}

fn load_config(path: Option<&Path>) -> anyhow::Result<Config> {
    let Some(path) = path else {
        return Ok(Config::default());
    };
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Reading configuration {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("Parsing configuration {}", path.display()))
}

impl Runner {
    /// A session over `host`, with the file store and the HTTP sources registered
    fn session(&self, host: Arc<MemoryHost>, confirmer: Arc<dyn Confirmer>) -> anyhow::Result<Session> {
        let storage = FileStorage::new_with_path(self.settings.storage.clone())?;
        tracing::debug!(path = %storage.path().display(), "Using storage");
        let store = DatasetStore::new(Box::new(storage));

        let mut session = Session::new(
            self.config.clone(),
            HostHandles::from_host(host),
            store,
            confirmer,
        );
        session.add_lalitpur_source(ReqwestClient::with_timeout(self.config.http_timeout_secs)?);
        if self.settings.enable_lalitpur && !session.url_source_enabled() {
            session.set_url_source_enabled(true);
        }
        Ok(session)
    }

    /// A session whose host shows `extent` with the house-number layer visible
    fn viewing_session(
        &self,
        extent: &ExtentArgs,
        host: Arc<MemoryHost>,
        confirmer: Arc<dyn Confirmer>,
    ) -> anyhow::Result<Session> {
        host.set_view(extent.rect()?, extent.zoom);
        host.toggle_layer(&self.config.house_numbers_layer, true);
        self.session(host, confirmer)
    }
}

pub async fn run(settings: Settings) -> anyhow::Result<()> {
    let mut config = load_config(settings.config.as_deref())?;
    if settings.enable_lalitpur {
        config.lalitpur.enabled = true;
    }
    let runner = Runner {
        config,
        settings: settings.clone(),
    };

    match settings.command {
        Command::Import { file, attributes } => import(&runner, &file, &attributes).await,
        Command::ImportUrl { url, attributes } => import_url(&runner, &url, &attributes).await,
        Command::Query { extent, geojson } => query(&runner, &extent, geojson).await,
        Command::Match {
            roads,
            extent,
            yes,
            output,
        } => match_extent(&runner, &roads, &extent, yes, output.as_deref()).await,
        Command::Clear { uploaded, url } => clear(&runner, uploaded, url).await,
        Command::ShowSettings { url_source } => show_settings(&runner, url_source),
    }
}

fn report_import(result: &ImportResult) {
    println!(
        "Imported {} features from {} ({} skipped)",
        result.features.len(),
        result.file_name,
        result.skipped
    );
    if let Some(bounds) = result.bounds {
        println!(
            "Bounds: {:.6},{:.6},{:.6},{:.6}",
            bounds.min().x,
            bounds.min().y,
            bounds.max().x,
            bounds.max().y
        );
    }
}

async fn import(runner: &Runner, file: &Path, attributes: &AttributeArgs) -> anyhow::Result<()> {
    let bytes =
        std::fs::read(file).with_context(|| format!("Reading {}", file.display()))?;
    let file_name = file
        .file_name()
        .and_then(|name| name.to_str())
        .context("File name is not valid UTF-8")?;

    let session = runner.session(Arc::new(MemoryHost::new()), Arc::new(StdinConfirmer))?;
    let selector = CliAttributeSelector::new(attributes.mapping());
    let result = session.import_file(&bytes, file_name, &selector).await?;
    report_import(&result);
    Ok(())
}

async fn import_url(runner: &Runner, url: &str, attributes: &AttributeArgs) -> anyhow::Result<()> {
    let session = runner.session(Arc::new(MemoryHost::new()), Arc::new(StdinConfirmer))?;
    let client = ReqwestClient::with_timeout(runner.config.http_timeout_secs)?;
    let selector = CliAttributeSelector::new(attributes.mapping());
    let result = session.import_url(&client, url, &selector).await?;
    report_import(&result);
    Ok(())
}

fn feature_json(feature: &Feature) -> serde_json::Value {
    json!({
        "type": "Feature",
        "id": feature.id.as_str(),
        "properties": feature.properties,
        "geometry": { "type": "Point", "coordinates": [feature.lon(), feature.lat()] }
    })
}

async fn query(runner: &Runner, extent: &ExtentArgs, geojson: bool) -> anyhow::Result<()> {
    let host = Arc::new(MemoryHost::new());
    let session = runner.viewing_session(extent, host, Arc::new(StdinConfirmer))?;
    let _events = session.start().await;
    let features = session.repository().get_extent_data(extent.rect()?).await;

    if geojson {
        let collection = json!({
            "type": "FeatureCollection",
            "features": features.iter().map(feature_json).collect::<Vec<_>>(),
        });
        println!("{}", serde_json::to_string_pretty(&collection)?);
    } else {
        for feature in &features {
            println!(
                "{}\t{}\t{}\t{:.7}\t{:.7}",
                feature.id,
                feature.number(),
                feature.street(),
                feature.lon(),
                feature.lat()
            );
        }
        println!("{} features", features.len());
    }
    session.dispose().await;
    Ok(())
}

async fn match_extent(
    runner: &Runner,
    roads: &Path,
    extent: &ExtentArgs,
    yes: bool,
    output: Option<&Path>,
) -> anyhow::Result<()> {
    let host = Arc::new(MemoryHost::new());
    let bytes = std::fs::read(roads).with_context(|| format!("Reading {}", roads.display()))?;
    host.load_roads_geojson(&bytes)?;

    let confirmer: Arc<dyn Confirmer> = if yes {
        Arc::new(AcceptAll)
    } else {
        Arc::new(StdinConfirmer)
    };
    let session = runner.viewing_session(extent, host.clone(), confirmer)?;
    let mut events = session.start().await;

    let drawn = host.drawn();
    tracing::info!(features = drawn.len(), "Matching visible features");
    let (mut attached, mut skipped) = (0, 0);
    for rendered in drawn {
        // Keep the street index current between clicks
        while let Ok(event) = events.try_recv() {
            session.handle_event(event).await?;
        }
        match session.click_feature(&rendered.feature.id).await? {
            Some(outcome) if outcome.attachment().is_some() => attached += 1,
            Some(MatchOutcome::RejectedNoSegment) => {
                anyhow::bail!("The road network has no segments to attach to")
            }
            _ => skipped += 1,
        }
    }
    println!("Attached {attached} house numbers, skipped {skipped}");

    if let Some(output) = output {
        let features: Vec<_> = host
            .house_numbers()
            .iter()
            .map(|hn| {
                json!({
                    "type": "Feature",
                    "properties": { "segment": hn.segment, "number": hn.number },
                    "geometry": { "type": "Point", "coordinates": [hn.point.x(), hn.point.y()] }
                })
            })
            .collect();
        let collection = json!({ "type": "FeatureCollection", "features": features });
        std::fs::write(output, serde_json::to_vec_pretty(&collection)?)
            .with_context(|| format!("Writing {}", output.display()))?;
        println!("Wrote {}", output.display());
    }
    session.dispose().await;
    Ok(())
}

async fn clear(runner: &Runner, uploaded: bool, url: bool) -> anyhow::Result<()> {
    let session = runner.session(Arc::new(MemoryHost::new()), Arc::new(StdinConfirmer))?;
    let both = !uploaded && !url;
    if uploaded || both {
        session.clear_uploaded_data().await;
        println!("Cleared uploaded data");
    }
    if url || both {
        session.clear_url_data().await;
        println!("Cleared URL data");
    }
    Ok(())
}

fn show_settings(runner: &Runner, url_source: Option<bool>) -> anyhow::Result<()> {
    let session = runner.session(Arc::new(MemoryHost::new()), Arc::new(StdinConfirmer))?;
    if let Some(enabled) = url_source {
        session.set_url_source_enabled(enabled);
    }

    println!("URL data source: {}", if session.url_source_enabled() { "enabled" } else { "disabled" });
    for kind in DatasetKind::ALL {
        match session.store().load(kind) {
            Some(dataset) => println!(
                "{:?} dataset: {} features from {} (stored {})",
                kind, dataset.count, dataset.filename, dataset.stored_at
            ),
            None => println!("{kind:?} dataset: none"),
        }
    }
    println!("{}", serde_json::to_string_pretty(session.config())?);
    Ok(())
}
