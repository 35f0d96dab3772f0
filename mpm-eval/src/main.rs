use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};

use mpm::scene::SceneConfig;
use mpm::{Communicator, LocalCluster, RunSummary, SimResult, SingleRank};

const ABOUT: &str = "
Distributed Material Point Method solver for elastic solids on a structured background grid.";

#[derive(Parser)]
#[clap(author, about = ABOUT, name = "mpm")]
struct Opt {
    /// Path to the scene configuration file in RON format.
    #[clap(name = "CONFIG", parse(from_os_str))]
    config: PathBuf,

    /// Spatial dimension of the scene.
    #[clap(short, long, default_value = "2", possible_values = ["2", "3"])]
    dim: usize,

    /// Number of ranks, each running on its own thread.
    #[clap(short, long, default_value = "1")]
    ranks: usize,

    /// Overrides the number of steps in the configuration.
    #[clap(short, long)]
    steps: Option<u64>,

    /// Resume from the latest checkpoint of the analysis.
    #[clap(long)]
    resume: bool,

    /// Overrides the output directory in the configuration.
    #[clap(short, long, parse(from_os_str))]
    output: Option<PathBuf>,

    #[clap(flatten)]
    verbose: clap_verbosity_flag::Verbosity,
}

pub fn main() {
    if let Err(err) = try_main() {
        eprintln!("{:?}", err);
        std::process::exit(1);
    }
}

fn run_rank<const D: usize, C: Communicator + Send>(
    scene: &SceneConfig,
    comm: C,
    interrupted: Arc<AtomicBool>,
) -> std::result::Result<RunSummary, mpm::Error> {
    let mut solver = scene.build_solver::<D, C>(comm)?;
    solver.set_interrupter(Box::new(move || interrupted.load(Ordering::Relaxed)));

    let progress = if solver.comm().is_root() {
        let nsteps = solver.config().analysis.nsteps;
        let pb = ProgressBar::new(nsteps);
        pb.set_style(
            ProgressStyle::with_template("{bar:40.cyan/blue} {pos}/{len} steps ({eta}) {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_bar()),
        );
        pb.set_position(solver.current_step());
        Some(pb)
    } else {
        None
    };

    let summary = solver.solve_with(|result| {
        if let Some(pb) = progress.as_ref() {
            pb.set_position(result.step);
            pb.set_message(format!("{} particles", result.total_particles));
        }
    });
    if let Some(pb) = progress {
        pb.finish_and_clear();
    }
    summary
}

fn run<const D: usize>(
    scene: &SceneConfig,
    ranks: usize,
    interrupted: Arc<AtomicBool>,
) -> std::result::Result<RunSummary, mpm::Error> {
    if ranks == 1 {
        return run_rank::<D, _>(scene, SingleRank, interrupted);
    }
    // Every rank reports the same summary on success. Report the first failure otherwise.
    let mut results = LocalCluster::run(ranks, |comm| {
        run_rank::<D, _>(scene, comm, Arc::clone(&interrupted))
    });
    match results.iter().position(|r| r.is_err()) {
        Some(i) => results.swap_remove(i),
        None => results.swap_remove(0),
    }
}

pub fn try_main() -> Result<()> {
    let opt = Opt::parse();

    let _ = env_logger::Builder::new()
        .filter_level(opt.verbose.log_level_filter())
        .parse_env("MPM_LOG")
        .try_init();

    if opt.ranks == 0 {
        anyhow::bail!("At least one rank is required");
    }

    let mut scene = SceneConfig::load_from_ron(&opt.config)?;
    if let Some(steps) = opt.steps {
        scene.config.analysis.nsteps = steps;
    }
    if let Some(output) = opt.output {
        scene.config.output.directory = output;
    }
    scene.config.resume.resume |= opt.resume;

    let interrupted = Arc::new(AtomicBool::new(false));
    {
        let interrupted = Arc::clone(&interrupted);
        ctrlc::set_handler(move || {
            log::warn!("Interrupt received, stopping after the current step");
            interrupted.store(true, Ordering::Relaxed);
        })?;
    }

    let result = match opt.dim {
        2 => run::<2>(&scene, opt.ranks, interrupted),
        3 => run::<3>(&scene, opt.ranks, interrupted),
        d => anyhow::bail!("Unsupported dimension: {}", d),
    };

    match SimResult::from(result) {
        SimResult::Success(msg) => {
            println!("{}", msg);
            Ok(())
        }
        SimResult::Warning(msg) => {
            println!("{}", msg);
            Ok(())
        }
        SimResult::Error(msg) => anyhow::bail!(msg),
    }
}
