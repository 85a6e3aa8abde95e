use lsp_types::{Diagnostic, DiagnosticSeverity, NumberOrString, Range};

/// Source tag attached to every diagnostic the engine emits.
pub const DIAGNOSTIC_SOURCE: &str = "skein";

/// Stable diagnostic codes (SK1xxx: build pipeline, SK2xxx: validation)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DiagnosticCode {
    SyntaxError,
    MissingToken,
    ReadFailure,
    ParserUnavailable,
    CyclicImport,
    UnresolvedImport,
    MissingImportedName,
    Redefinition,
}

impl DiagnosticCode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::SyntaxError => "SK1000",
            Self::MissingToken => "SK1001",
            Self::ReadFailure => "SK1002",
            Self::ParserUnavailable => "SK1003",
            Self::CyclicImport => "SK1100",
            Self::UnresolvedImport => "SK2000",
            Self::MissingImportedName => "SK2001",
            Self::Redefinition => "SK2002",
        }
    }

    pub fn severity(self) -> DiagnosticSeverity {
        match self {
            Self::SyntaxError | Self::MissingToken | Self::ReadFailure | Self::ParserUnavailable => {
                DiagnosticSeverity::ERROR
            }
            Self::UnresolvedImport | Self::MissingImportedName => DiagnosticSeverity::ERROR,
            Self::CyclicImport | Self::Redefinition => DiagnosticSeverity::WARNING,
        }
    }

    pub fn diagnostic(self, range: Range, message: impl Into<String>) -> Diagnostic {
        Diagnostic::new(
            range,
            Some(self.severity()),
            Some(NumberOrString::String(self.as_str().to_string())),
            Some(DIAGNOSTIC_SOURCE.to_string()),
            message.into(),
            None,
            None,
        )
    }
}

/// Code string of a diagnostic produced by this crate, if any.
pub fn code_of(diagnostic: &Diagnostic) -> Option<&str> {
    match &diagnostic.code {
        Some(NumberOrString::String(code)) => Some(code.as_str()),
        _ => None,
    }
}
