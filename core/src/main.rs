use anyhow::Context as _;
use clap::Parser;
use geode_projection::*;
use std::path::PathBuf;

/// SAT-driven search for the best harvesting setup of an amethyst geode.
#[derive(Parser)]
#[command(name = "geode")]
struct Args {
    /// JSON layout file mapping layer heights to bud offsets, e.g.
    /// {"10": [[9, 9]]}. Defaults to the built-in sample geode.
    #[arg(long)]
    layout: Option<PathBuf>,

    /// Lowest harvested-cluster count worth reporting at all.
    #[arg(long, default_value_t = 0)]
    floor: usize,

    /// Print the best assignment as JSON when the search finishes.
    #[arg(long)]
    json: bool,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // --- 1. Load and decode the layout ---
    let layout = match &args.layout {
        Some(path) => {
            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("reading layout file {}", path.display()))?;
            serde_json::from_str(&raw)
                .with_context(|| format!("parsing layout file {}", path.display()))?
        }
        None => sample_geode(),
    };

    let ctx = GeodeContext::build(&layout)?;
    println!("--- Geode Projection Optimizer ---");
    println!(
        "{} budding amethysts, {} cluster candidates, {} slices ({} potential 1x1 holes)",
        ctx.layout.buds.len(),
        ctx.layout.clusters.len(),
        ctx.vars.slices.len(),
        ctx.holes.potential_holes.len(),
    );
    println!("Searching for assignments scoring at least {}...", args.floor);

    // --- 2. Tighten the lower bound until the solver gives up ---
    let mut optimizer = Optimizer::new(ctx, args.floor);
    loop {
        match optimizer.step()? {
            SearchState::Improved(improvement) => {
                println!(
                    "Score: {} ({} projections)",
                    improvement.score, improvement.projections
                );
            }
            SearchState::Exhausted => break,
            SearchState::Searching => {}
        }
    }

    // --- 3. Report the best assignment found ---
    match optimizer.best() {
        Some(best) => {
            println!("\nBest score: {} harvested clusters", best.score);
            if args.json {
                let report = serde_json::json!({
                    "score": best.score,
                    "projections": best.projections,
                    "assignment": best.assignment.named(),
                });
                println!("{}", serde_json::to_string_pretty(&report)?);
            }
        }
        None => println!("\nNo feasible assignment at or above {}", args.floor),
    }

    Ok(())
}
