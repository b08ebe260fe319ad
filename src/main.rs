fn main() -> anyhow::Result<()> {
    warden::cli::run()
}
