use ofs_loader_cli::cli::ofs_loader_main;

fn main() {
    ofs_loader_main();
}
