use anyhow::Result;

fn main() -> Result<()> {
    coderun::cli::run()
}
