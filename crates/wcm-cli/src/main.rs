use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde::Deserialize;
use tracing::info;
use uuid::Uuid;
use wcm_core::GeoPoint;
use wcm_engine::routing::{plan_route, RoutePlan, RoutePoint};
use wcm_engine::EngineConfig;
use wcm_storage::PgStore;

#[derive(Debug, Parser)]
#[command(name = "wcm-cli")]
#[command(about = "Waste collection request and route management")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the HTTP API.
    Serve,
    /// Apply the embedded SQL migrations to DATABASE_URL.
    Migrate,
    /// Print a nearest-neighbour visiting order for a YAML stop list.
    Optimize {
        #[arg(long)]
        file: PathBuf,
        /// Id or name of the stop to start from; defaults to the first stop.
        #[arg(long)]
        start: Option<String>,
    },
}

#[derive(Debug, Deserialize)]
struct StopsFile {
    stops: Vec<StopEntry>,
}

#[derive(Debug, Deserialize)]
struct StopEntry {
    #[serde(default)]
    id: Option<Uuid>,
    name: String,
    lat: f64,
    lng: f64,
}

struct NamedPoint {
    name: String,
    point: RoutePoint,
}

fn load_stops(path: &Path) -> Result<Vec<NamedPoint>> {
    let raw = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    let file: StopsFile = serde_yaml::from_str(&raw).with_context(|| format!("parsing {}", path.display()))?;
    if file.stops.is_empty() {
        bail!("{} lists no stops", path.display());
    }
    file.stops
        .into_iter()
        .map(|entry| -> Result<NamedPoint> {
            GeoPoint::new(entry.lat, entry.lng).with_context(|| format!("stop '{}'", entry.name))?;
            Ok(NamedPoint {
                point: RoutePoint {
                    id: entry.id.unwrap_or_else(Uuid::new_v4),
                    lat: entry.lat,
                    lng: entry.lng,
                },
                name: entry.name,
            })
        })
        .collect()
}

fn resolve_start(stops: &[NamedPoint], start: Option<&str>) -> Result<Option<Uuid>> {
    let Some(wanted) = start else {
        return Ok(None);
    };
    stops
        .iter()
        .find(|s| s.name == wanted || s.point.id.to_string() == wanted)
        .map(|s| Some(s.point.id))
        .with_context(|| format!("no stop named or identified by '{wanted}'"))
}

fn render_plan(stops: &[NamedPoint], plan: &RoutePlan) -> String {
    let name_of = |id: &Uuid| {
        stops
            .iter()
            .find(|s| s.point.id == *id)
            .map(|s| s.name.as_str())
            .unwrap_or("?")
    };
    let mut out = String::new();
    for (idx, id) in plan.order.iter().enumerate() {
        let leg = if idx == 0 {
            "start".to_string()
        } else {
            format!("+{:.2} km", plan.legs_km[idx - 1])
        };
        out.push_str(&format!("{:>3}. {:<30} {}\n", idx + 1, name_of(id), leg));
    }
    out.push_str(&format!("total: {:.2} km over {} stops\n", plan.total_km, plan.order.len()));
    out
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "wcm_cli=info,wcm_engine=info,wcm_web=info,wcm_ports=info".into()),
        )
        .init();

    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => {
            wcm_web::serve(EngineConfig::from_env()).await?;
        }
        Commands::Migrate => {
            let config = EngineConfig::from_env();
            let Some(url) = config.database_url else {
                bail!("DATABASE_URL must be set to run migrations");
            };
            let store = PgStore::connect(&url).await.context("connecting to DATABASE_URL")?;
            store.migrate().await.context("applying migrations")?;
            info!("migrations applied");
            println!("migrations applied");
        }
        Commands::Optimize { file, start } => {
            let stops = load_stops(&file)?;
            let points = stops.iter().map(|s| s.point).collect::<Vec<_>>();
            let start = resolve_start(&stops, start.as_deref())?;
            let plan = plan_route(&points, start)?;
            print!("{}", render_plan(&stops, &plan));
        }
    }

    Ok(())
}
