use crate::error::IngestError;
use std::path::Path;

pub trait DocumentReader: Send + Sync {
    /// Returns the plain text of the document uploaded as `name`.
    fn read(&self, name: &str, bytes: &[u8]) -> Result<String, IngestError>;
}

/// Reads Word documents, joining paragraph texts with newlines.
#[derive(Debug, Default, Clone, Copy)]
pub struct DocxReader;

impl DocumentReader for DocxReader {
    fn read(&self, name: &str, bytes: &[u8]) -> Result<String, IngestError> {
        use docx_rs::{DocumentChild, ParagraphChild, RunChild};

        let docx = docx_rs::read_docx(bytes).map_err(|error| IngestError::Unreadable {
            name: name.to_string(),
            details: format!("{error:?}"),
        })?;

        let paragraphs = docx
            .document
            .children
            .iter()
            .filter_map(|child| match child {
                DocumentChild::Paragraph(paragraph) => Some(paragraph),
                _ => None,
            })
            .map(|paragraph| {
                let mut text = String::new();
                for paragraph_child in &paragraph.children {
                    if let ParagraphChild::Run(run) = paragraph_child {
                        for run_child in &run.children {
                            match run_child {
                                RunChild::Text(t) => text.push_str(&t.text),
                                RunChild::Tab(_) => text.push('\t'),
                                _ => {}
                            }
                        }
                    }
                }
                text
            })
            .collect::<Vec<_>>();

        Ok(paragraphs.join("\n"))
    }
}

/// Reads UTF-8 text files as-is.
#[derive(Debug, Default, Clone, Copy)]
pub struct PlainTextReader;

impl DocumentReader for PlainTextReader {
    fn read(&self, name: &str, bytes: &[u8]) -> Result<String, IngestError> {
        String::from_utf8(bytes.to_vec()).map_err(|error| IngestError::Unreadable {
            name: name.to_string(),
            details: error.to_string(),
        })
    }
}

/// Dispatches to a concrete reader by file extension.
#[derive(Debug, Default, Clone, Copy)]
pub struct ExtensionReader {
    docx: DocxReader,
    text: PlainTextReader,
}

pub const SUPPORTED_EXTENSIONS: [&str; 3] = ["docx", "txt", "md"];

impl DocumentReader for ExtensionReader {
    fn read(&self, name: &str, bytes: &[u8]) -> Result<String, IngestError> {
        let extension = Path::new(name)
            .extension()
            .and_then(|ext| ext.to_str())
            .map(str::to_ascii_lowercase)
            .unwrap_or_default();

        match extension.as_str() {
            "docx" => self.docx.read(name, bytes),
            "txt" | "md" => self.text.read(name, bytes),
            _ => Err(IngestError::UnsupportedFileType(name.to_string())),
        }
    }
}

pub fn is_supported(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| {
            SUPPORTED_EXTENSIONS
                .iter()
                .any(|supported| ext.eq_ignore_ascii_case(supported))
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn corrupt_docx_is_reported_as_unreadable() {
        let result = DocxReader.read("broken.docx", b"not a zip archive");
        assert!(matches!(
            result,
            Err(IngestError::Unreadable { name, .. }) if name == "broken.docx"
        ));
    }

    #[test]
    fn plain_text_requires_utf8() {
        assert_eq!(PlainTextReader.read("a.txt", b"hello").unwrap(), "hello");
        assert!(PlainTextReader.read("a.txt", &[0xff, 0xfe, 0xfd]).is_err());
    }

    #[test]
    fn extension_reader_rejects_unknown_types() {
        let reader = ExtensionReader::default();
        assert_eq!(reader.read("NOTES.MD", b"# notes").unwrap(), "# notes");
        assert!(matches!(
            reader.read("image.png", b"\x89PNG"),
            Err(IngestError::UnsupportedFileType(_))
        ));
    }

    #[test]
    fn supported_extensions_are_case_insensitive() {
        assert!(is_supported(Path::new("/tmp/Report.DOCX")));
        assert!(!is_supported(Path::new("/tmp/report.pdf")));
    }
}
