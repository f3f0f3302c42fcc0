//! Interface de terminal do autoapply: spinner de execução e saída colorida.
//!
//! Usa as crates `indicatif` para o spinner de progresso e `console` para
//! estilização com cores. O [`RunProgress`] acompanha visualmente uma
//! execução do scheduler no terminal.

use console::Style;
use indicatif::{ProgressBar, ProgressStyle};

use crate::scheduler::{PlatformSnapshot, RunSummary};
use crate::state_machine::{FinalState, OutcomeRecord};

/// Indicador visual de progresso de uma execução.
///
/// Exibe um spinner com os contadores de cada plataforma e mensagens
/// coloridas para sucesso (verde), falha (vermelho) e descarte (amarelo).
pub struct RunProgress {
    // Spinner do indicatif.
    pb: ProgressBar,
    green: Style,
    red: Style,
    yellow: Style,
    dim: Style,
}

impl RunProgress {
    /// Inicia o spinner com um título.
    pub fn start(title: &str) -> Self {
        let pb = ProgressBar::new_spinner();
        if let Ok(style) = ProgressStyle::default_spinner().template("{spinner:.cyan} {msg}") {
            pb.set_style(style);
        }
        pb.set_message(title.to_string());
        pb.enable_steady_tick(std::time::Duration::from_millis(100));

        Self {
            pb,
            green: Style::new().green().bold(),
            red: Style::new().red().bold(),
            yellow: Style::new().yellow(),
            dim: Style::new().dim(),
        }
    }

    /// Atualiza o spinner com o estado atual das plataformas.
    pub fn update(&self, snapshots: &[PlatformSnapshot]) {
        self.pb.set_message(status_line(snapshots));
    }

    /// Finaliza o spinner e imprime o resumo da execução.
    pub fn finish(&self, summary: &RunSummary) {
        self.pb.finish_and_clear();
        println!();
        for (platform, report) in &summary.platforms {
            println!(
                "  {platform}: {} {}  {} {}  {} {}",
                self.green.apply_to("✓"),
                report.succeeded,
                self.yellow.apply_to("–"),
                report.skipped,
                self.red.apply_to("✗"),
                report.failed,
            );
            for (class, count) in &report.by_class {
                println!("      {}", self.dim.apply_to(format!("{class}: {count}")));
            }
        }
        println!(
            "  {} {} submitted, {} skipped, {} failed",
            self.green.apply_to("Total:"),
            summary.total(FinalState::Succeeded),
            summary.total(FinalState::Skipped),
            summary.total(FinalState::Failed),
        );
    }

    /// Imprime os registros de resultado lidos do arquivo de tracking.
    pub fn print_records(&self, records: &[OutcomeRecord]) {
        self.pb.finish_and_clear();
        if records.is_empty() {
            println!("  {}", self.dim.apply_to("No outcomes recorded."));
            return;
        }
        for record in records {
            println!("{}", self.format_record(record));
        }
    }

    fn format_record(&self, record: &OutcomeRecord) -> String {
        let (mark, style) = match record.final_state {
            FinalState::Succeeded => ("✓", &self.green),
            FinalState::Skipped => ("–", &self.yellow),
            FinalState::Failed => ("✗", &self.red),
        };
        let detail = match (&record.confirmation, record.error) {
            (Some(confirmation), _) => confirmation.clone(),
            (None, Some(class)) => class.to_string(),
            (None, None) => record
                .score
                .map(|s| format!("score {s:.2}"))
                .unwrap_or_default(),
        };
        format!(
            "  {} {}/{} {} @ {} {}",
            style.apply_to(mark),
            record.platform,
            record.job_id,
            record.title,
            record.company,
            self.dim.apply_to(detail),
        )
    }
}

/// Linha compacta com os contadores de cada plataforma.
pub fn status_line(snapshots: &[PlatformSnapshot]) -> String {
    snapshots
        .iter()
        .map(|s| {
            let mut line = format!(
                "{} queued {} active {} ok {} skipped {} failed {}",
                s.platform, s.queued, s.in_flight, s.succeeded, s.skipped, s.failed
            );
            if s.cooling_down > 0 {
                line.push_str(&format!(" cool-down {}", s.cooling_down));
            }
            if s.held > 0 {
                line.push_str(&format!(" held {}", s.held));
            }
            if s.parked > 0 {
                line.push_str(&format!(" captcha {}", s.parked));
            }
            if s.discovering {
                line.push_str(" (searching)");
            }
            line
        })
        .collect::<Vec<_>>()
        .join(" | ")
}
