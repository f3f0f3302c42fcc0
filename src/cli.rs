//! Interface de linha de comando do autoapply baseada em clap.
//!
//! Define a struct [`Cli`] com subcomandos [`Command`] (run, demo, status)
//! e flags globais (--config, --max-retries, --verbose).

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// autoapply: candidaturas automáticas em várias plataformas de vagas.
#[derive(Debug, Parser)]
#[command(name = "autoapply", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Caminho do arquivo de configuração (padrão: `autoapply.toml`).
    #[arg(long, short, global = true)]
    pub config: Option<PathBuf>,

    /// Número máximo de retentativas em caso de falha transitória.
    #[arg(long, global = true)]
    pub max_retries: Option<u32>,

    /// Habilita saída detalhada (verbose).
    #[arg(long, short, global = true, default_value_t = false)]
    pub verbose: bool,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Executa as buscas configuradas e candidata-se às vagas encontradas.
    Run {
        /// Executa apenas estas plataformas (pode repetir).
        #[arg(long = "platform")]
        platforms: Vec<String>,
    },

    /// Mostra os resultados registrados no arquivo de tracking.
    Status {
        /// Arquivo JSONL a ler (padrão: o da configuração).
        #[arg(long)]
        file: Option<PathBuf>,
    },

    /// Executa a demonstração embutida com plataformas simuladas.
    Demo,
}
