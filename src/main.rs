//! snake-evo: evolve, inspect and replay snake-playing policies.

use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand};
use rand::SeedableRng;
use rand::rngs::SmallRng;
use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use snake_evo::codec;
use snake_evo::context::{RunContext, RunEnd};
use snake_evo::draw::render_frame;
use snake_evo::game::EpisodeSettings;
use snake_evo::genome::NetworkShape;
use snake_evo::replay::Replay;
use snake_evo::storage::{GenomeStore, SessionId, SqliteStore};
use snake_evo::{Evolution, EvolutionConfig};

const DEFAULT_DB: &str = "evolution.db";

#[derive(Parser)]
#[command(name = "snake-evo")]
#[command(author, version, about = "Evolve snake-playing policies with a genetic algorithm", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run evolution until victory, interrupt, or the generation limit
    Train(TrainArgs),

    /// List stored sessions
    Sessions {
        #[arg(long, default_value = DEFAULT_DB)]
        db: PathBuf,

        /// Maximum sessions to list
        #[arg(short, long, default_value = "20")]
        limit: usize,
    },

    /// Print the generation history of a session
    History {
        #[arg(long, default_value = DEFAULT_DB)]
        db: PathBuf,

        #[arg(short, long)]
        session: SessionId,
    },

    /// List the fittest stored genomes
    Best {
        #[arg(long, default_value = DEFAULT_DB)]
        db: PathBuf,

        /// Restrict to one session (default: all sessions)
        #[arg(short, long)]
        session: Option<SessionId>,

        #[arg(short, long, default_value = "10")]
        limit: usize,
    },

    /// Replay the best stored genome for one episode
    Show {
        #[arg(long, default_value = DEFAULT_DB)]
        db: PathBuf,

        /// Session to take the genome from (default: best across all sessions)
        #[arg(short, long)]
        session: Option<SessionId>,

        /// Print every frame as a text grid
        #[arg(long)]
        frames: bool,

        /// Print every frame as a JSON line instead
        #[arg(long, conflicts_with = "frames")]
        json: bool,

        /// Seed for food placement and action sampling
        #[arg(long, default_value = "0")]
        seed: u64,
    },

    /// Write the default configuration as TOML
    InitConfig {
        #[arg(default_value = "snake-evo.toml")]
        path: PathBuf,
    },
}

#[derive(Args)]
struct TrainArgs {
    /// TOML configuration file; flags below override it
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Population size
    #[arg(long)]
    pop: Option<usize>,

    /// Elite size
    #[arg(long)]
    elite: Option<usize>,

    /// Grid side length
    #[arg(long)]
    grid: Option<usize>,

    #[arg(long)]
    mutation_rate: Option<f32>,

    #[arg(long)]
    mutation_strength: Option<f32>,

    #[arg(long)]
    max_steps: Option<usize>,

    #[arg(long)]
    starvation_timeout: Option<u32>,

    /// Master seed for a reproducible run
    #[arg(long)]
    seed: Option<u64>,

    /// Evaluate agents one after another instead of on the thread pool
    #[arg(long)]
    sequential: bool,

    /// Larger population and elite with stronger mutation
    #[arg(long)]
    fast: bool,

    /// Generations to run; 0 runs until victory or interrupt
    #[arg(short, long, default_value = "0")]
    generations: u32,

    #[arg(long, default_value = DEFAULT_DB)]
    db: PathBuf,

    /// Do not persist anything
    #[arg(long, conflicts_with_all = ["continue_session", "resume_best"])]
    no_db: bool,

    /// Continue a stored session from its best genome
    #[arg(long = "continue", value_name = "SESSION_ID")]
    continue_session: Option<SessionId>,

    /// Start a new session seeded with the best genome across all sessions
    #[arg(long, conflicts_with = "continue_session")]
    resume_best: bool,

    /// Free-form note stored with a new session
    #[arg(long)]
    notes: Option<String>,
}

impl TrainArgs {
    fn apply(&self, config: &mut EvolutionConfig) {
        if self.fast {
            config.population_size = 200;
            config.elite_size = 30;
            config.mutation.rate = 0.15;
            config.mutation.strength = 0.25;
        }
        if let Some(v) = self.pop {
            config.population_size = v;
        }
        if let Some(v) = self.elite {
            config.elite_size = v;
        }
        if let Some(v) = self.grid {
            config.grid_size = v;
        }
        if let Some(v) = self.mutation_rate {
            config.mutation.rate = v;
        }
        if let Some(v) = self.mutation_strength {
            config.mutation.strength = v;
        }
        if let Some(v) = self.max_steps {
            config.max_steps = v;
        }
        if let Some(v) = self.starvation_timeout {
            config.hunger.starvation_timeout = v;
        }
        if self.seed.is_some() {
            config.seed = self.seed;
        }
        if self.sequential {
            config.parallel = false;
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Train(args) => train(args).await,
        Commands::Sessions { db, limit } => list_sessions(&db, limit),
        Commands::History { db, session } => print_history(&db, session),
        Commands::Best { db, session, limit } => list_best(&db, session, limit),
        Commands::Show {
            db,
            session,
            frames,
            json,
            seed,
        } => show(&db, session, frames, json, seed),
        Commands::InitConfig { path } => {
            EvolutionConfig::default().save(&path)?;
            println!("Wrote default configuration to {}", path.display());
            Ok(())
        }
    }
}

fn open_store(path: &Path) -> Result<SqliteStore> {
    SqliteStore::open(path).with_context(|| format!("Failed to open database: {}", path.display()))
}

async fn train(args: TrainArgs) -> Result<()> {
    let store = if args.no_db {
        None
    } else {
        Some(open_store(&args.db)?)
    };

    let session_config = match (args.continue_session, &store) {
        (Some(id), Some(store)) => Some(
            store
                .session_config(id)
                .with_context(|| format!("Cannot continue session {id}"))?,
        ),
        _ => None,
    };
    let mut config = match (&args.config, session_config) {
        (Some(path), _) => EvolutionConfig::load(path)?,
        (None, Some(stored)) => stored,
        (None, None) => EvolutionConfig::default(),
    };
    args.apply(&mut config);

    let mut evolution = Evolution::new(config.clone()).context("Invalid configuration")?;
    let mut ctx = match (store, args.continue_session) {
        (Some(store), Some(id)) => {
            let (ctx, done) = RunContext::continue_session(store, id)
                .with_context(|| format!("Cannot continue session {id}"))?;
            evolution.resume_from(done);
            info!(session = id, generation = done, "continuing session");
            ctx
        }
        (Some(store), None) => {
            let id = store.create_session(&config, args.notes.as_deref())?;
            info!(session = id, db = %args.db.display(), "new session");
            RunContext::with_store(store, id)
        }
        (None, _) => RunContext::detached(),
    };

    if args.continue_session.is_some() || args.resume_best {
        let mut rng = match config.seed {
            Some(seed) => SmallRng::seed_from_u64(seed),
            None => SmallRng::from_entropy(),
        };
        match ctx.stored_genome(args.continue_session, evolution.shape(), &mut rng)? {
            Some(genome) => evolution.seed_genome(genome)?,
            None => info!("no stored genome, starting from a random population"),
        }
    }

    info!(
        population = config.population_size,
        elite = config.elite_size,
        grid = config.grid_size,
        sensors = config.network.sensors.width(),
        parallel = config.parallel,
        "starting evolution"
    );

    let stop = ctx.stop_flag();
    let slot = ctx.checkpoint_slot();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_err() {
            return;
        }
        stop.store(true, Ordering::SeqCst);
        let generation = slot
            .read()
            .ok()
            .and_then(|c| c.as_ref().map(|c| c.generation))
            .unwrap_or(0);
        warn!(
            generation,
            "interrupt received, stopping after the current generation (Ctrl-C again to exit now)"
        );
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("second interrupt, exiting without saving");
            std::process::exit(130);
        }
    });

    let limit = (args.generations > 0).then_some(args.generations);
    let (end, checkpoint) = tokio::task::spawn_blocking(move || -> Result<_> {
        let end = ctx.run(&mut evolution, limit)?;
        ctx.finalize(&evolution)?;
        Ok((end, evolution.checkpoint()))
    })
    .await
    .context("Training task failed")??;

    match end {
        RunEnd::Victory => println!("Victory at generation {}!", checkpoint.generation),
        RunEnd::Interrupted => println!("Stopped at generation {}", checkpoint.generation),
        RunEnd::GenerationLimit => println!("Finished {} generations", checkpoint.generation),
    }
    println!("Best fitness: {:.1}", checkpoint.best_fitness());
    Ok(())
}

fn list_sessions(db: &Path, limit: usize) -> Result<()> {
    let store = open_store(db)?;
    let sessions = store.sessions(limit)?;
    if sessions.is_empty() {
        println!("No sessions in {}", db.display());
        return Ok(());
    }
    println!(
        "{:>4}  {:<19}  {:>5}  {:>4}  {:>6}  {:>6}  {:>10}  notes",
        "id", "started", "pop", "grid", "rate", "gens", "best"
    );
    for s in sessions {
        println!(
            "{:>4}  {:<19}  {:>5}  {:>4}  {:>6.3}  {:>6}  {:>10.1}  {}",
            s.id,
            s.started_at,
            s.population_size,
            s.grid_size,
            s.mutation_rate,
            s.total_generations,
            s.best_fitness,
            s.notes.unwrap_or_default()
        );
    }
    Ok(())
}

fn print_history(db: &Path, session: SessionId) -> Result<()> {
    let store = open_store(db)?;
    let s = store
        .session(session)
        .with_context(|| format!("No session {session} in {}", db.display()))?;
    println!("Session {} started {}", s.id, s.started_at);
    println!(
        "  population {}, elite {}, grid {}x{}, mutation rate {:.3}, strength {:.3}, max steps {}",
        s.population_size,
        s.elite_size,
        s.grid_size,
        s.grid_size,
        s.mutation_rate,
        s.mutation_strength,
        s.max_steps
    );
    if let Some(notes) = &s.notes {
        println!("  notes: {notes}");
    }
    println!();

    let history = store.generation_history(session)?;
    if history.is_empty() {
        println!("Session {session} has no recorded generations");
        return Ok(());
    }
    println!("{:>6}  {:>10}  {:>10}", "gen", "best", "avg");
    for r in &history {
        println!(
            "{:>6}  {:>10.1}  {:>10.1}",
            r.generation, r.best_fitness, r.avg_fitness
        );
    }
    let peak = history
        .iter()
        .map(|r| r.best_fitness)
        .fold(f32::MIN, f32::max);
    println!("{} generations, peak fitness {:.1}", history.len(), peak);
    Ok(())
}

fn list_best(db: &Path, session: Option<SessionId>, limit: usize) -> Result<()> {
    let store = open_store(db)?;
    let best = store.best_genomes(session, limit)?;
    if best.is_empty() {
        println!("No stored genomes in {}", db.display());
        return Ok(());
    }
    println!(
        "{:>4}  {:>7}  {:>6}  {:>10}  {:>6}",
        "rank", "session", "gen", "fitness", "format"
    );
    for (rank, g) in best.iter().enumerate() {
        let format = codec::format_tag(&g.bytes)
            .map_or_else(|_| "?".to_string(), |tag| tag.to_string());
        println!(
            "{:>4}  {:>7}  {:>6}  {:>10.1}  {:>6}",
            rank + 1,
            g.session,
            g.generation,
            g.fitness,
            format
        );
    }
    Ok(())
}

fn show(
    db: &Path,
    session: Option<SessionId>,
    frames: bool,
    json: bool,
    seed: u64,
) -> Result<()> {
    let store = open_store(db)?;
    let stored = match session {
        Some(id) => store.load_best_genome(id)?,
        None => store.best_overall()?,
    };
    let Some(stored) = stored else {
        bail!("No stored genome in {}", db.display());
    };
    let config = store.session_config(stored.session)?;
    let shape = NetworkShape::from_config(&config.network);
    let mut rng = SmallRng::seed_from_u64(seed);
    let genome = codec::load_or_random(&stored.bytes, &shape, &mut rng);
    println!(
        "Session {} generation {} fitness {:.1}",
        stored.session, stored.generation, stored.fitness
    );

    let settings = EpisodeSettings::for_generation(&config, stored.generation);
    let mut replay = Replay::new(&genome, settings, seed);
    let outcome = if frames || json {
        loop {
            let frame = replay.frame();
            if json {
                println!("{}", serde_json::to_string(&frame)?);
            } else {
                println!("{}\n", render_frame(&frame));
            }
            if replay.is_finished() {
                break replay.run_to_end()?;
            }
            replay.step()?;
        }
    } else {
        replay.run_to_end()?
    };
    println!(
        "{:?} after {} steps: length {}, fitness {:.1}",
        outcome.end, outcome.steps, outcome.length, outcome.fitness
    );
    Ok(())
}
