use once_cell::sync::OnceCell;

static LOGS: OnceCell<()> = OnceCell::new();

pub fn init_logs() {
    LOGS.get_or_init(|| {
        let _ = env_logger::builder().is_test(true).try_init();
    });
}
