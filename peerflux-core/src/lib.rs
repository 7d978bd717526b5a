/// The current version of the peerflux backend.
pub const VERSION: &str = "0.1.0";

pub mod core;

#[cfg(any(test, feature = "testing"))]
pub mod testing {
    use log::{trace, LevelFilter};
    use log4rs::append::console::ConsoleAppender;
    use log4rs::config::{Appender, Logger, Root};
    use log4rs::encode::pattern::PatternEncoder;
    use log4rs::Config;
    use std::fs;
    use std::path::PathBuf;
    use std::sync::Once;
    use std::time::Duration;
    use tempfile::TempDir;
    use tokio::select;
    use tokio::sync::mpsc::UnboundedReceiver;

    static INIT: Once = Once::new();

    /// Initializes the logger with the specified log level.
    #[macro_export]
    macro_rules! init_logger {
        ($level:expr) => {
            $crate::testing::init_logger_level($level)
        };
        () => {
            $crate::testing::init_logger_level(log::LevelFilter::Trace)
        };
    }

    /// Initializes the logger with the specified log level.
    pub fn init_logger_level(level: LevelFilter) {
        INIT.call_once(|| {
            log4rs::init_config(Config::builder()
                .appender(Appender::builder().build("stdout", Box::new(ConsoleAppender::builder()
                    .encoder(Box::new(PatternEncoder::new("\x1B[37m{d(%Y-%m-%d %H:%M:%S%.3f)}\x1B[0m {h({l:>5.5})} \x1B[35m{I:>6.6}\x1B[0m \x1B[37m---\x1B[0m \x1B[37m[{T:>15.15}]\x1B[0m \x1B[36m{t:<60.60}\x1B[0m \x1B[37m:\x1B[0m {m}{n}")))
                    .build())))
                .logger(Logger::builder().build("fx_callback", LevelFilter::Info))
                .logger(Logger::builder().build("hyper", LevelFilter::Info))
                .logger(Logger::builder().build("hyper_util", LevelFilter::Info))
                .logger(Logger::builder().build("mio", LevelFilter::Info))
                .logger(Logger::builder().build("reqwest", LevelFilter::Info))
                .logger(Logger::builder().build("tracing", LevelFilter::Info))
                .logger(Logger::builder().build("want", LevelFilter::Info))
                .build(Root::builder().appender("stdout").build(level))
                .unwrap())
                .unwrap();
        })
    }

    /// Write a file with the given contents into the temp directory.
    /// Parent directories are created as needed.
    ///
    /// It returns the path of the written file.
    pub fn write_tmp_dir_file(
        temp_dir: &TempDir,
        filename: &str,
        contents: impl AsRef<[u8]>,
    ) -> PathBuf {
        let path = temp_dir.path().join(filename);

        fs::create_dir_all(path.parent().unwrap()).unwrap();
        trace!("Writing test file {:?}", path);
        fs::write(&path, contents).unwrap();

        path
    }

    /// Read a file from the temp directory as a string.
    pub fn read_tmp_dir_file_as_string(temp_dir: &TempDir, filename: &str) -> String {
        let path = temp_dir.path().join(filename);

        trace!("Reading temp filepath {:?}", path);
        match fs::read_to_string(&path) {
            Ok(e) => e,
            Err(e) => panic!("Failed to read temp file {:?}, {}", path, e),
        }
    }

    #[macro_export]
    macro_rules! assert_timeout {
        ($timeout:expr, $condition:expr) => {{
            assert_timeout!($timeout, $condition, "")
        }};
        ($timeout:expr, $condition:expr, $message:expr) => {{
            use std::time::Duration;
            use tokio::select;
            use tokio::time;

            let result = select! {
                _ = time::sleep($timeout) => false,
                result = async {
                    loop {
                        if $condition {
                            return true;
                        }

                        time::sleep(Duration::from_millis(10)).await;
                    }
                } => result,
            };

            if !result {
                assert!(
                    false,
                    concat!("Timeout assertion failed after {:?}: ", $message),
                    $timeout
                );
            }
        }};
    }

    #[macro_export]
    macro_rules! assert_timeout_eq {
        ($timeout:expr, $left:expr, $right:expr) => {{
            let mut actual_value = $right;
            let result = tokio::select! {
                _ = tokio::time::sleep($timeout) => false,
                result = async {
                    loop {
                        actual_value = $right;
                        if $left == actual_value {
                            return true;
                        }

                        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
                    }
                } => result,
            };

            if !result {
                assert!(
                    false,
                    "Assertion timed out after {:?}, expected {} but got {} instead",
                    $timeout, $left, actual_value
                );
            }
        }};
    }

    /// Receive a message from the given receiver, or panic if the timeout is reached.
    #[macro_export]
    macro_rules! recv_timeout {
        ($receiver:expr, $timeout:expr) => {
            $crate::testing::recv_timeout($receiver, $timeout, "expected to receive an instance")
                .await
        };
        ($receiver:expr, $timeout:expr, $message:expr) => {
            $crate::testing::recv_timeout($receiver, $timeout, $message).await
        };
    }

    /// Receive a message from the given receiver, or panic if the timeout is reached.
    ///
    /// # Arguments
    ///
    /// * `receiver` - The receiver to receive the message from.
    /// * `timeout` - The timeout to wait for the message.
    /// * `message` - The message to print if the timeout is reached.
    ///
    /// # Returns
    ///
    /// It returns the received instance of `T`.
    pub async fn recv_timeout<T>(
        receiver: &mut UnboundedReceiver<T>,
        timeout: Duration,
        message: &str,
    ) -> T {
        select! {
            _ = tokio::time::sleep(timeout) => panic!("receiver timed-out after {}ms, {}", timeout.as_millis(), message),
            result = receiver.recv() => result.expect(message)
        }
    }
}
