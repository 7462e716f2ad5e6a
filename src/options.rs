use clap::Args;

/// Switches of the middle end. A driver embeds these in its own command line
/// with `#[command(flatten)]`.
#[derive(Debug, Clone, Default, Args)]
pub struct CompilerOptions {
    /// Number SSA versions with one counter for the whole module instead of
    /// one counter per variable
    #[arg(long)]
    pub debug_ssa_ids: bool,

    /// Evaluate every WHERE clause in generated code, never in the database
    #[arg(long)]
    pub no_sql_pushdown: bool,

    /// Check dominance, phi completeness and strictness of the generated IL
    #[arg(long)]
    pub verify_il: bool,

    /// Print the generated IL to stdout
    #[arg(long)]
    pub print_il: bool,
}
