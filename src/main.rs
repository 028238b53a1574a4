fn main() -> anyhow::Result<()> {
    quikgrade_lib::run()
}
