mod build;
mod cli;
mod config;
mod download;
mod ffmpeg;
mod logging;
mod process;
mod runner;
mod templates;
mod util;
mod ytdlp;

fn main() -> anyhow::Result<()> {
    let app = cli::parse();
    logging::init(app.verbose);
    runner::run(app)
}
