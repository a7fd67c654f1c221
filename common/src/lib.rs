use owo_colors::OwoColorize;

pub mod backoff;
pub mod shutdown;

pub fn signal_ready() {
    std::fs::write("/etc/ready", "ready").expect("Failed to write readiness file");
}

pub mod annotations {
    pub const SPEC_HASH: &str = "eno.azure.io/spec-hash";
    pub const COMPOSITION_GENERATION: &str = "eno.azure.io/composition-generation";
    pub const SYNTHESIZER_GENERATION: &str = "eno.azure.io/synthesizer-generation";
    pub const SYNTHESIS_UUID: &str = "eno.azure.io/synthesis-uuid";
    pub const REVISION: &str = "eno.azure.io/revision";
}

pub fn init() {
    let disable_colors = ["1", "true"].contains(
        &std::env::var("DISABLE_COLORS")
            .unwrap_or_else(|_| String::new())
            .to_lowercase()
            .as_str(),
    );
    owo_colors::set_override(!disable_colors);
}

pub fn print_error<T: std::fmt::Display>(e: T) {
    eprintln!("{} {}", "error:".red().bold(), e.to_string().red());
}

pub fn print_warning<T: std::fmt::Display>(e: T) {
    eprintln!("{} {}", "warn:".yellow().bold(), e.to_string().yellow());
}
