use anyhow::{Context, bail};
use clap::{Args, Parser, Subcommand};
use geo::Rect;
use quick_hn_lib::AttributeMapping;
use quick_hn_lib::utils::{extent_is_valid, extent_to_rect};
use std::path::PathBuf;

#[derive(Parser, Debug, Clone)]
#[clap(author, version, about, long_about = None)]
/// Quick HN Importer - Import open address points as house numbers
pub struct Settings {
    /// Storage file for imported datasets and settings
    #[clap(long, value_name = "FILE", env = "QHNI_STORAGE", global = true)]
    pub storage: Option<PathBuf>,

    /// Enable the Lalitpur Metropolitan City source and remember the choice
    #[clap(long, default_value = "false", global = true)]
    pub enable_lalitpur: bool,

    /// JSON file overriding the library configuration
    #[clap(long, value_name = "FILE", global = true)]
    pub config: Option<PathBuf>,

    #[clap(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Import an address file (GeoJSON, KML, KMZ, GPX, GML, WKT or ZIP) as the uploaded dataset
    Import {
        #[clap(value_name = "FILE")]
        file: PathBuf,

        #[clap(flatten)]
        attributes: AttributeArgs,
    },

    /// Fetch a remote address file and import it as the URL dataset
    ImportUrl {
        url: String,

        #[clap(flatten)]
        attributes: AttributeArgs,
    },

    /// List the address features inside an extent
    Query {
        #[clap(flatten)]
        extent: ExtentArgs,

        /// Print a GeoJSON FeatureCollection instead of one line per feature
        #[clap(long, default_value = "false")]
        geojson: bool,
    },

    /// Attach the house numbers inside an extent to the segments of a road network
    Match {
        /// GeoJSON road network (line strings with `id`, `street` and `alt_streets`)
        #[clap(long, value_name = "FILE")]
        roads: PathBuf,

        #[clap(flatten)]
        extent: ExtentArgs,

        /// Accept every fallback match without asking
        #[clap(short, long, default_value = "false")]
        yes: bool,

        /// Write the created house numbers as GeoJSON
        #[clap(short, long, value_name = "FILE")]
        output: Option<PathBuf>,
    },

    /// Remove stored datasets; both when no kind is given
    Clear {
        #[clap(long, default_value = "false")]
        uploaded: bool,

        #[clap(long, default_value = "false")]
        url: bool,
    },

    /// Show or change persisted settings
    #[clap(name = "settings")]
    ShowSettings {
        /// Enable or disable the URL data source
        #[clap(long, value_name = "BOOL")]
        url_source: Option<bool>,
    },
}

/// Which input property feeds which canonical field; guessed when `--number` is missing
#[derive(Args, Debug, Clone, Default)]
pub struct AttributeArgs {
    /// Property holding the house number
    #[clap(long, value_name = "KEY")]
    pub number: Option<String>,

    /// Property holding the street name
    #[clap(long, value_name = "KEY")]
    pub street: Option<String>,

    /// Property holding the Nepali text
    #[clap(long, value_name = "KEY")]
    pub nepali: Option<String>,
}

impl AttributeArgs {
    pub fn mapping(&self) -> Option<AttributeMapping> {
        let mut mapping = AttributeMapping::new(self.number.clone()?);
        if let Some(street) = &self.street {
            mapping = mapping.with_street(street);
        }
        if let Some(nepali) = &self.nepali {
            mapping = mapping.with_nepali_text(nepali);
        }
        Some(mapping)
    }
}

#[derive(Args, Debug, Clone)]
pub struct ExtentArgs {
    /// Extent as min_lon,min_lat,max_lon,max_lat in degrees
    #[clap(long, value_delimiter = ',', allow_hyphen_values = true, required = true)]
    pub bbox: Vec<f64>,

    /// Map zoom level of the view
    #[clap(long, default_value = "19")]
    pub zoom: u8,
}

impl ExtentArgs {
    pub fn rect(&self) -> anyhow::Result<Rect<f64>> {
        let extent: [f64; 4] = self
            .bbox
            .as_slice()
            .try_into()
            .context("--bbox needs exactly four values")?;
        if !extent_is_valid(&extent) {
            bail!("--bbox {extent:?} is not a valid extent");
        }
        Ok(extent_to_rect(&extent))
    }
}
