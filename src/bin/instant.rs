use anyhow::Result;

fn main() -> Result<()> {
    instant_eval::cli::run()
}
