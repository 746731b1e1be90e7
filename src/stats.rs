#[derive(Debug, Clone)]
pub struct PingStatistics {
    pub packets_sent: u32,
    pub packets_received: u32,
    pub packets_lost: u32,
    pub packets_failed: u32,
    pub min_time: f64,
    pub max_time: f64,
    pub total_time: f64,
}

impl PingStatistics {
    pub fn new() -> Self {
        Self {
            packets_sent: 0,
            packets_received: 0,
            packets_lost: 0,
            packets_failed: 0,
            min_time: f64::INFINITY,
            max_time: 0.0,
            total_time: 0.0,
        }
    }

    pub fn reset(&mut self) {
        *self = Self::new();
    }

    pub fn record_sent(&mut self) -> u32 {
        self.packets_sent += 1;
        self.packets_sent
    }

    pub fn record_received(&mut self, time_ms: f64) -> u32 {
        self.packets_received += 1;
        self.total_time += time_ms;

        if time_ms < self.min_time {
            self.min_time = time_ms;
        }

        if time_ms > self.max_time {
            self.max_time = time_ms;
        }

        self.packets_received
    }

    pub fn record_lost(&mut self) -> u32 {
        self.packets_lost += 1;
        self.packets_lost
    }

    pub fn record_failed(&mut self) -> u32 {
        self.packets_failed += 1;
        self.packets_failed
    }

    pub fn loss_percentage(&self) -> f64 {
        if self.packets_sent == 0 {
            return 0.0;
        }
        (self.packets_lost as f64 / self.packets_sent as f64) * 100.0
    }

    /// `100 - ((received + failed) * 100 / sent)` in integer arithmetic, or 100
    /// until the first reply arrives.
    ///
    /// The division truncates: 42 sent with 41 received gives `100 - 97 = 3`,
    /// not 2.38. Callers depend on that exact value.
    pub fn failure_percentage(&self) -> f64 {
        if self.packets_received == 0 {
            return 100.0;
        }

        let answered = (self.packets_received as u64 + self.packets_failed as u64) * 100;
        match answered.checked_div(self.packets_sent as u64) {
            Some(ratio) => 100.0 - ratio as f64,
            None => 100.0,
        }
    }

    pub fn average_time(&self) -> f64 {
        if self.packets_received == 0 {
            return 0.0;
        }
        self.total_time / self.packets_received as f64
    }

    /// Running mean RTT in milliseconds, rounded to two decimals.
    pub fn jitter_average(&self) -> f64 {
        round_to(self.average_time(), 2)
    }

    pub fn format_summary(&self, target: &str) -> String {
        let loss_percent = self.loss_percentage();

        let mut summary = format!(
            "\n{} 的 Ping 统计信息:\n    数据包: 已发送 = {}, 已接收 = {}, 丢失 = {} ({:.0}% 丢失), 失败 = {},\n",
            target,
            self.packets_sent,
            self.packets_received,
            self.packets_lost,
            loss_percent,
            self.packets_failed
        );

        if self.packets_received > 0 {
            let min_time = if self.min_time == f64::INFINITY { 0.0 } else { self.min_time };
            summary.push_str(&format!(
                "往返行程的估计时间(以毫秒为单位):\n    最短 = {:.2}ms，最长 = {:.2}ms，平均 = {:.2}ms\n",
                min_time,
                self.max_time,
                self.jitter_average()
            ));
        }

        summary
    }

    pub fn format_header(&self, target: &str, resolved_ip: &str, payload_size: usize) -> String {
        if target == resolved_ip {
            format!("正在 Ping {} 具有 {} 字节的数据:", target, payload_size)
        } else {
            format!("正在 Ping {} [{}] 具有 {} 字节的数据:", target, resolved_ip, payload_size)
        }
    }
}

impl Default for PingStatistics {
    fn default() -> Self {
        Self::new()
    }
}

/// Round half away from zero.
pub fn round_to(value: f64, digits: i32) -> f64 {
    let multiplier = 10f64.powi(digits);
    (value * multiplier).round() / multiplier
}

pub fn format_rtt(time_ms: f64) -> String {
    format!("{:.2} ms", time_ms)
}
