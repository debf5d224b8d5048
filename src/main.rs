use clap::Parser;
use dotenv::dotenv;
use slide_embed::config::{Args, Config, RunPaths};
use slide_embed::launch::launch;
use slide_embed::EmbedError;

fn main() -> Result<(), EmbedError> {
    dotenv().ok();
    slide_embed::init_tracing();

    let args = Args::parse();
    let config = Config::load(&args.config_file)?;
    let paths = RunPaths::new(&config, &args.run_id)?;

    let summary = launch(&config, &paths, args.world_size)?;
    println!("{}", summary);
    Ok(())
}
