fn main() {
    if let Err(err) = captable_io::run() {
        eprintln!("error: {err:#}");
        std::process::exit(1);
    }
}
