use anyhow::Result;

fn main() -> Result<()> {
    gearbox::cli::run()
}
