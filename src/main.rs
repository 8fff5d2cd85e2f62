fn main() {
    let args = std::env::args();
    if let Err(err) = dwarfs::run(args) {
        eprintln!("dwarfs error: {err}");
        std::process::exit(1);
    }
}
