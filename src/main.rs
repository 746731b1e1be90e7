mod cli;

use echoping::utils;
use echoping::{PingDelegate, PingReporter, PingSession};

/// Prints each delegate callback the way the console ping does.
struct ConsoleDelegate {
    target: String,
    jitter: f64,
}

impl PingDelegate for ConsoleDelegate {
    fn packets_sent(&mut self, count: u32) {
        log::debug!("已发送 {} 个数据包", count);
    }

    fn packets_received(&mut self, count: u32, rtt: &str) {
        println!("{}", format_reply(&self.target, count, rtt, self.jitter));
    }

    fn packets_failed(&mut self, count: u32, percentage: f64) {
        println!("请求失败 (第 {} 次)，失败率 {:.0}%", count, percentage);
    }

    fn jitter_average(&mut self, average: f64) {
        self.jitter = average;
    }
}

/// `count` is the running total of replies, not the echo sequence number.
fn format_reply(target: &str, count: u32, rtt: &str, jitter: f64) -> String {
    format!("来自 {} 的回复: 已接收={} 时间={} 抖动均值={:.2}ms", target, count, rtt, jitter)
}

#[tokio::main]
async fn main() {
    // Enable debug logging if RUST_LOG is set
    if std::env::var("RUST_LOG").is_ok() {
        env_logger::init();
    }

    // Parse command line arguments
    let args = match cli::parse_args() {
        Ok(args) => args,
        Err(e) => {
            utils::exit_with_error(&format!("参数解析错误: {}", e), 1);
        }
    };

    let config = match args.to_config() {
        Ok(config) => config,
        Err(e) => {
            utils::exit_with_error(&e.to_string(), 1);
        }
    };

    let mut session = PingSession::new();
    let events = session.subscribe();
    let reporter = PingReporter::new(ConsoleDelegate {
        target: args.target.clone(),
        jitter: 0.0,
    });

    if let Err(e) = session.start(config.clone()).await {
        utils::exit_with_error(&format!("无法启动 Ping '{}': {}", args.target, e), 1);
    }

    // Print header
    if let Some(target) = session.target() {
        println!(
            "{}",
            reporter
                .statistics()
                .format_header(&args.target, &target.address.to_string(), config.payload_size)
        );
    }

    let reporter = tokio::spawn(reporter.run(events));

    // Setup signal handler for Ctrl+C
    let mut shutdown_signal = utils::setup_signal_handler();

    tokio::select! {
        Ok(()) = &mut shutdown_signal => {}
        _ = session.wait_stopped() => {}
    }

    session.stop().await;
    drop(session);

    // Print statistics
    match reporter.await {
        Ok(reporter) => println!("{}", reporter.statistics().format_summary(&args.target)),
        Err(e) => utils::exit_with_error(&format!("统计任务异常结束: {}", e), 1),
    }
}
