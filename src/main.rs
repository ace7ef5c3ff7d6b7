fn main() {
    if let Err(err) = canvas3d::run() {
        eprintln!("Application error: {err}");
    }
}
