//! Annotation router.
//!
//! Comments in the symbol stream fall into three classes: type
//! signatures (a bare `(` following a definition, recognized once a
//! `--` or `->` token appears), custom annotations (`(name ...)` where
//! `name` was registered by the host), and free text. The router
//! classifies each comment and dispatches to an [`AnnotationHandler`].
//!
//! Custom annotations come in three flavors: immediate (dispatched at
//! the closing paren with no subject), prefix (deferred and attached to
//! the next definition), and postfix (attached to the preceding
//! definition).

use crate::sym::{Symbol, SymbolKind};
use crate::source::Region;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnnotationKind {
    Immediate,
    Prefix,
    Postfix,
}

/// A custom annotation name registered by the host.
#[derive(Debug, Clone)]
pub struct Annotation {
    pub name: String,
    pub kind: AnnotationKind,
    deferred: Option<Region>,
}

impl Annotation {
    pub fn new(name: impl Into<String>, kind: AnnotationKind) -> Self {
        Self {
            name: name.into(),
            kind,
            deferred: None,
        }
    }
}

/// Receives classified annotations.
pub trait AnnotationHandler {
    /// A type signature comment attached to `sym`.
    fn handle_type(&mut self, sym: &Symbol, region: &Region);

    /// A custom annotation; `sym` is the subject definition, absent for
    /// immediate annotations.
    fn handle_custom(
        &mut self,
        name: &str,
        kind: AnnotationKind,
        sym: Option<&Symbol>,
        region: &Region,
    );
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CommentKind {
    MightBeType,
    IsType,
    IsCustom,
    IsText,
}

/// Streaming comment classifier over the assembler symbol stream.
#[derive(Debug, Default)]
pub struct AnnotationRouter {
    annotations: Vec<Annotation>,
    current_sym: Option<Symbol>,
    comment_start: Option<Symbol>,
    first_token: Option<Symbol>,
    last_token: Option<Symbol>,
    comment_kind: Option<CommentKind>,
    current_annotation: Option<usize>,
}

impl AnnotationRouter {
    pub fn new(annotations: Vec<Annotation>) -> Self {
        Self {
            annotations,
            ..Self::default()
        }
    }

    pub fn handle_symbol(&mut self, sym: &Symbol, handler: &mut dyn AnnotationHandler) {
        match sym.kind {
            SymbolKind::Comment => self.handle_comment(sym, handler),
            SymbolKind::Macro | SymbolKind::Label if !sym.name_is_generated => {
                self.current_sym = Some(sym.clone());
                // Apply deferred prefix annotations
                for index in 0..self.annotations.len() {
                    if let Some(region) = self.annotations[index].deferred.take() {
                        let (name, kind) =
                            (self.annotations[index].name.clone(), self.annotations[index].kind);
                        handler.handle_custom(&name, kind, Some(sym), &region);
                    }
                }
            }
            _ => {}
        }
    }

    fn handle_comment(&mut self, sym: &Symbol, handler: &mut dyn AnnotationHandler) {
        let name = sym.name.as_deref().unwrap_or("");
        if sym.id == 0 {
            // Comment start
            self.comment_start = Some(sym.clone());
            self.first_token = None;
            self.last_token = None;
            self.current_annotation = None;
            if name == "(" {
                self.comment_kind = Some(if self.current_sym.is_some() {
                    CommentKind::MightBeType
                } else {
                    CommentKind::IsText
                });
            } else {
                self.comment_kind = Some(CommentKind::IsText);
                // Find a matching annotation
                if let Some(index) = self
                    .annotations
                    .iter()
                    .position(|anno| anno.name == name[1..])
                {
                    self.current_annotation = Some(index);
                    self.comment_kind = Some(CommentKind::IsCustom);
                }
            }
        } else if sym.id == 1 && name == ")" {
            // Comment end
            let Some(start) = self.comment_start.take() else {
                return;
            };

            let mut region = start.region.clone();
            if let Some(first) = &self.first_token {
                region.start = first.region.start;
            }
            region.end = match &self.last_token {
                Some(last) => last.region.end,
                None => sym.region.start,
            };

            match self.comment_kind {
                Some(CommentKind::IsType) => {
                    if let Some(current) = &self.current_sym {
                        handler.handle_type(current, &region);
                    }
                }
                Some(CommentKind::IsCustom) => {
                    if let Some(index) = self.current_annotation {
                        let (name, kind) =
                            (self.annotations[index].name.clone(), self.annotations[index].kind);
                        match kind {
                            AnnotationKind::Immediate => {
                                handler.handle_custom(&name, kind, None, &region)
                            }
                            AnnotationKind::Prefix => {
                                self.annotations[index].deferred = Some(region)
                            }
                            AnnotationKind::Postfix => handler.handle_custom(
                                &name,
                                kind,
                                self.current_sym.clone().as_ref(),
                                &region,
                            ),
                        }
                    }
                }
                _ => {}
            }

            self.first_token = None;
            self.last_token = None;
            self.current_sym = None;
            self.current_annotation = None;
        } else {
            // Intermediate token
            if self.first_token.is_none() {
                self.first_token = Some(sym.clone());
            }
            self.last_token = Some(sym.clone());

            if self.comment_kind == Some(CommentKind::MightBeType) && (name == "--" || name == "->")
            {
                self.comment_kind = Some(CommentKind::IsType);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::{Interner, Pos, Region};

    #[derive(Default)]
    struct Recorder {
        types: Vec<String>,
        customs: Vec<(String, Option<String>)>,
    }

    impl AnnotationHandler for Recorder {
        fn handle_type(&mut self, sym: &Symbol, _region: &Region) {
            self.types.push(sym.name.as_deref().unwrap_or("").to_string());
        }

        fn handle_custom(
            &mut self,
            name: &str,
            _kind: AnnotationKind,
            sym: Option<&Symbol>,
            _region: &Region,
        ) {
            self.customs.push((
                name.to_string(),
                sym.map(|s| s.name.as_deref().unwrap_or("").to_string()),
            ));
        }
    }

    struct Stream {
        interner: Interner,
        router: AnnotationRouter,
        recorder: Recorder,
    }

    impl Stream {
        fn new(annotations: Vec<Annotation>) -> Self {
            Self {
                interner: Interner::default(),
                router: AnnotationRouter::new(annotations),
                recorder: Recorder::default(),
            }
        }

        fn feed(&mut self, kind: SymbolKind, name: &str, id: u16) {
            let sym = Symbol {
                kind,
                id,
                name: Some(self.interner.intern(name)),
                name_is_generated: false,
                region: Region {
                    filename: self.interner.intern("t.tal"),
                    start: Pos::start(),
                    end: Pos::start(),
                },
            };
            self.router.handle_symbol(&sym, &mut self.recorder);
        }

        fn comment(&mut self, tokens: &[&str]) {
            self.feed(SymbolKind::Comment, tokens[0], 0);
            for token in &tokens[1..] {
                self.feed(SymbolKind::Comment, token, 1);
            }
            self.feed(SymbolKind::Comment, ")", 1);
        }
    }

    #[test]
    fn signature_after_label() {
        let mut stream = Stream::new(Vec::new());
        stream.feed(SymbolKind::Label, "draw", 1);
        stream.comment(&["(", "x", "y", "--"]);
        assert_eq!(stream.recorder.types, vec!["draw"]);
    }

    #[test]
    fn free_text_is_not_a_signature() {
        let mut stream = Stream::new(Vec::new());
        stream.feed(SymbolKind::Label, "draw", 1);
        stream.comment(&["(", "just", "a", "note"]);
        assert!(stream.recorder.types.is_empty());
    }

    #[test]
    fn standalone_comment_is_text() {
        let mut stream = Stream::new(Vec::new());
        stream.comment(&["(", "--"]);
        assert!(stream.recorder.types.is_empty());
    }

    #[test]
    fn postfix_annotation_names_its_subject() {
        let mut stream = Stream::new(vec![Annotation::new(
            "deprecated",
            AnnotationKind::Postfix,
        )]);
        stream.feed(SymbolKind::Label, "old-draw", 1);
        stream.comment(&["(deprecated"]);
        assert_eq!(
            stream.recorder.customs,
            vec![("deprecated".to_string(), Some("old-draw".to_string()))]
        );
    }

    #[test]
    fn prefix_annotation_defers_to_next_definition() {
        let mut stream = Stream::new(vec![Annotation::new("export", AnnotationKind::Prefix)]);
        stream.comment(&["(export"]);
        assert!(stream.recorder.customs.is_empty());
        stream.feed(SymbolKind::Label, "main", 1);
        assert_eq!(
            stream.recorder.customs,
            vec![("export".to_string(), Some("main".to_string()))]
        );
    }

    #[test]
    fn immediate_annotation_fires_at_close() {
        let mut stream = Stream::new(vec![Annotation::new("barrier", AnnotationKind::Immediate)]);
        stream.comment(&["(barrier"]);
        assert_eq!(stream.recorder.customs, vec![("barrier".to_string(), None)]);
    }
}
