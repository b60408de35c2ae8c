//! Game Review - Classifies every move of a chess game with a UCI engine.
//!
//! Reads a PGN (or a list of UCI moves), asks the engine for the evaluation
//! before and after each move and prints one line per ply, or JSON.

use std::io::Read;
use std::path::PathBuf;

use anyhow::{bail, Context};
use clap::{Args, Parser, Subcommand};
use move_analysis::engine::PositionAnalyzer;
use move_analysis::rules;
use move_analysis::{
    convert_line, AnalysisRecord, AnalyzerError, ClassifierKind, EngineLauncher, Game,
    GameAnalyzer, ReviewConfig,
};
use tokio::signal;
use tracing_subscriber::EnvFilter;

/// Review a chess game move by move.
#[derive(Parser)]
#[command(name = "game-review")]
#[command(about = "Classifies the moves of a chess game with a UCI engine")]
struct Cli {
    /// Configuration file
    #[arg(long, global = true, default_value = ReviewConfig::DEFAULT_PATH)]
    config: PathBuf,

    /// Engine executable (overrides engine.path)
    #[arg(long, global = true)]
    engine: Option<PathBuf>,

    /// Search depth per position
    #[arg(long, global = true, conflicts_with = "movetime")]
    depth: Option<u32>,

    /// Search time per position in milliseconds
    #[arg(long, global = true)]
    movetime: Option<u64>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Analyze every move of a game
    Review(ReviewArgs),
    /// Print the engine's best line for a position
    Line(LineArgs),
}

#[derive(Args)]
struct ReviewArgs {
    /// PGN file ("-" for stdin); the first game is reviewed
    #[arg(required_unless_present = "moves")]
    pgn: Option<PathBuf>,

    /// Space-separated UCI moves instead of a PGN
    #[arg(long, conflicts_with = "pgn")]
    moves: Option<String>,

    /// Starting position for --moves
    #[arg(long, requires = "moves")]
    fen: Option<String>,

    /// Analyze at most this many plies
    #[arg(long)]
    max_moves: Option<usize>,

    /// simplified, win_probability or context_aware
    #[arg(long)]
    classifier: Option<ClassifierKind>,

    /// Print records as JSON
    #[arg(long)]
    json: bool,

    /// Skip commentary even if a narrator is configured
    #[arg(long)]
    no_commentary: bool,
}

#[derive(Args)]
struct LineArgs {
    /// Position to search (defaults to the starting position)
    fen: Option<String>,

    /// Number of ranked lines to request
    #[arg(long, default_value = "1")]
    count: u32,
}

impl Cli {
    fn apply_overrides(&self, config: &mut ReviewConfig) {
        if let Some(engine) = &self.engine {
            config.engine.path = engine.clone();
        }
        if let Some(depth) = self.depth {
            config.engine.depth = Some(depth);
            config.engine.movetime_ms = None;
        }
        if let Some(movetime) = self.movetime {
            config.engine.movetime_ms = Some(movetime);
            config.engine.depth = None;
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();
    let cli = Cli::parse();

    let mut config = ReviewConfig::load(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;
    cli.apply_overrides(&mut config);

    match cli.command {
        Commands::Review(args) => review(config, args).await,
        Commands::Line(args) => line(config, args).await,
    }
}

async fn review(config: ReviewConfig, args: ReviewArgs) -> anyhow::Result<()> {
    let game = load_game(&args)?;
    let limit = config.search_limit()?;
    let mut analysis = config.analysis_config()?;
    if let Some(classifier) = args.classifier {
        analysis.classifier = classifier;
    }
    let max_moves = args.max_moves.or_else(|| config.max_moves());

    tracing::info!("Engine: {}", config.engine.path.display());
    tracing::info!("Limit: {}, classifier: {}", limit, analysis.classifier);

    let mut analyzer = GameAnalyzer::new(config.launcher(), analysis);
    if !args.no_commentary {
        if let Some(narrator) = config.narrator() {
            analyzer = analyzer.with_narrator(Box::new(narrator));
        }
    }

    let cancel = analyzer.cancel_token();
    tokio::spawn(async move {
        if signal::ctrl_c().await.is_ok() {
            tracing::info!("Interrupt received, stopping after the current move");
            cancel.cancel();
        }
    });

    let outcome =
        tokio::task::spawn_blocking(move || analyzer.run(&game, limit, max_moves)).await?;

    match outcome {
        Ok(records) => print_records(&records, args.json),
        Err(AnalyzerError::Cancelled { records }) => {
            print_records(&records, args.json)?;
            bail!("analysis cancelled after {} moves", records.len())
        }
        Err(e) => Err(e.into()),
    }
}

async fn line(config: ReviewConfig, args: LineArgs) -> anyhow::Result<()> {
    let pos = match &args.fen {
        Some(fen) => rules::from_position_string(fen)?,
        None => Default::default(),
    };
    let limit = config.search_limit()?;
    let launcher = config.launcher();

    let line = tokio::task::spawn_blocking(move || -> anyhow::Result<Vec<String>> {
        let mut engine = launcher.launch()?;
        let moves = engine.best_line(&pos, limit, args.count);
        engine.close();
        Ok(convert_line(&pos, &moves))
    })
    .await??;

    if line.is_empty() {
        println!("(no line)");
    } else {
        println!("{}", line.join(" "));
    }
    Ok(())
}

fn load_game(args: &ReviewArgs) -> anyhow::Result<Game> {
    if let Some(moves) = &args.moves {
        let moves: Vec<&str> = moves.split_whitespace().collect();
        return Ok(Game::from_uci_moves(args.fen.as_deref(), &moves)?);
    }

    let text = match args.pgn.as_deref() {
        Some(path) if path.as_os_str() != "-" => std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?,
        _ => {
            let mut text = String::new();
            std::io::stdin().read_to_string(&mut text)?;
            text
        }
    };
    let game = Game::from_pgn(&text)?;
    if let (Some(white), Some(black)) = (&game.tags.white, &game.tags.black) {
        tracing::info!("{} vs {}", white, black);
    }
    Ok(game)
}

fn print_records(records: &[AnalysisRecord], json: bool) -> anyhow::Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(records)?);
        return Ok(());
    }
    for record in records {
        println!("{}", format_record(record));
        if let Some(commentary) = &record.commentary {
            println!("    {}", commentary);
        }
    }
    Ok(())
}

/// `ply. SAN  eval  best  label  line`, one line per record.
fn format_record(record: &AnalysisRecord) -> String {
    let number = match record.ply % 2 {
        0 => format!("{}.", record.ply / 2 + 1),
        _ => format!("{}...", record.ply / 2 + 1),
    };
    let eval = record
        .eval_after
        .map_or_else(|| "?".to_string(), |e| format!("{:+.2}", e));
    let best = record.best_move_san.as_deref().unwrap_or("-");
    let label = record
        .quality
        .map_or_else(|| "unclassified".to_string(), |q| q.to_string());
    let line: Vec<&str> = record
        .best_line
        .iter()
        .take(8)
        .map(String::as_str)
        .collect();

    format!(
        "{:<6} {:<8} {:>7}  best {:<8} {:<22} {}",
        number,
        record.move_san,
        eval,
        best,
        label,
        line.join(" ")
    )
}
