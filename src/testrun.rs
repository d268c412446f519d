use crate::logger::Logger;
use crate::sandbox::Executor;

#[derive(Debug, Clone)]
pub struct TestOutcome {
    pub passed: bool,
    pub output: String,
}

/// Run pytest on the test file through the sandboxed executor.
/// A missing test file is an ordinary failure, not an error -- the model is
/// told what went wrong and gets to try again.
pub async fn run_tests(executor: &Executor, test_filename: &str, logger: &Logger) -> TestOutcome {
    if !executor.workspace().join(test_filename).exists() {
        return TestOutcome {
            passed: false,
            output: format!("Test file not found: {test_filename}"),
        };
    }

    let result = executor
        .execute(
            &format!("python -m pytest {test_filename} -v --tb=short 2>&1"),
            logger,
        )
        .await;

    TestOutcome {
        passed: result.returncode == 0,
        output: format!("{}{}", result.stdout, result.stderr),
    }
}
