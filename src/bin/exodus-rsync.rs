use exodus_rsync::cmd;

#[tokio::main]
async fn main() {
    let args: Vec<String> = std::env::args().collect();
    std::process::exit(cmd::run(args).await);
}
