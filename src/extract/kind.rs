use crate::types::Modality;

/// File kinds the content indexer understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ContentKind {
    PlainText,
    Html,
    Pdf,
    /// Office Open XML word processing documents
    Docx,
    Image,
}

impl ContentKind {
    /// Detect kind from a lower-cased extension without the dot.
    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext.to_lowercase().as_str() {
            "txt" | "md" | "rst" | "csv" | "json" | "yaml" | "yml" | "toml" | "xml" | "log"
            | "py" | "rs" | "js" | "ts" | "java" | "c" | "cpp" | "h" | "hpp" | "go" | "rb"
            | "sh" => Some(ContentKind::PlainText),
            "html" | "htm" => Some(ContentKind::Html),
            "pdf" => Some(ContentKind::Pdf),
            "docx" => Some(ContentKind::Docx),
            "jpg" | "jpeg" | "png" | "webp" => Some(ContentKind::Image),
            _ => None,
        }
    }

    /// Embedding space records of this kind are stored in.
    pub fn modality(&self) -> Modality {
        match self {
            ContentKind::Image => Modality::Image,
            _ => Modality::Text,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_extension() {
        assert_eq!(ContentKind::from_extension("md"), Some(ContentKind::PlainText));
        assert_eq!(ContentKind::from_extension("HTM"), Some(ContentKind::Html));
        assert_eq!(ContentKind::from_extension("docx"), Some(ContentKind::Docx));
        assert_eq!(ContentKind::from_extension("jpeg"), Some(ContentKind::Image));
        assert_eq!(ContentKind::from_extension("exe"), None);
        assert_eq!(ContentKind::from_extension(""), None);
    }

    #[test]
    fn test_modality() {
        assert_eq!(ContentKind::Pdf.modality(), Modality::Text);
        assert_eq!(ContentKind::Image.modality(), Modality::Image);
    }
}
