use objectfs::fs::demo;

#[tokio::main(flavor = "current_thread")]
async fn main() {
    env_logger::init();
    let mut args = std::env::args().skip(1);
    match args.next().as_deref() {
        Some("demo-localfs") => {
            let dir = match args.next() {
                Some(p) => p,
                None => {
                    eprintln!("Usage: objectfs demo-localfs <dir>");
                    std::process::exit(2);
                }
            };
            match demo::e2e_localfs_demo(dir).await {
                Ok(()) => println!("demo-localfs: OK"),
                Err(e) => {
                    eprintln!("demo-localfs failed: {e}");
                    std::process::exit(1);
                }
            }
        }
        _ => {
            println!("objectfs\nUsage:\n  objectfs demo-localfs <dir>");
        }
    }
}
