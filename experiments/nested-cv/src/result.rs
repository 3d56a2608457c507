//! 实验结果.

use rad_berry::pipeline::RunReport;
use std::io::{self, Write};

/// 实验最终结果.
pub struct ExperimentResult {
    report: RunReport,
}

impl ExperimentResult {
    pub fn new(report: RunReport) -> Self {
        Self { report }
    }

    /// 是否只有部分折成功?
    #[inline]
    pub fn is_partial(&self) -> bool {
        self.report.is_partial()
    }

    fn write_into<W: Write>(&self, w: &mut W) -> io::Result<()> {
        utils::sep_to(&mut *w)?;
        self.report.describe_into(w)?;
        utils::sep_to(&mut *w)?;
        for f in &self.report.folds {
            writeln!(w, "fold {}: {}", f.fold, f.selected_features.join(", "))?;
        }
        Ok(())
    }

    /// 分析运行结果.
    pub fn analyze(&self) {
        let mut buf = Vec::with_capacity(2048);
        match self.write_into(&mut buf) {
            Ok(()) => print!("{}", String::from_utf8_lossy(&buf)),
            Err(e) => log::error!("Report formatting error: {e}"),
        }
        utils::sep();
    }
}
