use serde::Serialize;

use crate::retrieval::{Example, RetrievalMode, RetrievalOutcome};

pub const DEFAULT_TEMPLATE: &str = "{{instruction}}:\n\n{{text}}";
pub const SIMILARITY_UNAVAILABLE_TEMPLATE: &str = "{{instruction}} (RAG indisponible):\n\n{{text}}";
pub const SIMILARITY_EMPTY_TEMPLATE: &str =
    "{{instruction}} (aucun exemple similaire trouvé):\n\n{{text}}";
pub const SIMILARITY_TEMPLATE: &str = "{{instruction}} en utilisant ces exemples :\n\n{{examples}}Texte à traduire en breton:\n{{text}}";
pub const RANDOM_UNAVAILABLE_TEMPLATE: &str =
    "{{instruction}} (exemples aléatoires indisponibles):\n\n{{text}}";
pub const RANDOM_TEMPLATE: &str = "Voici quelques paires français-breton aléatoires de la base de données:\n\n{{examples}}Traduire le texte suivant en breton:\n{{text}}";
pub const EXAMPLE_TEMPLATE: &str = "Français : {{source}}\nBreton : {{target}}\n\n";

/// Language a backend produces; only picks the wording of the plain default prompt.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetLanguage {
    Breton,
    English,
}

impl TargetLanguage {
    pub fn default_instruction(self) -> &'static str {
        match self {
            Self::Breton => "Traduire en breton",
            Self::English => "Translate to English",
        }
    }

    /// Header of the plain default prompt, e.g. `"Traduire en breton:\n\n"`.
    pub fn default_header(self) -> String {
        format!("{}:\n\n", self.default_instruction())
    }
}

/// Build the prompt sent to a backend.
///
/// Examples are emitted in retrieval order; augmented and fallback prompts
/// always use the Breton wording.
pub fn assemble_prompt(
    mode: RetrievalMode,
    outcome: &RetrievalOutcome,
    text: &str,
    target: TargetLanguage,
) -> String {
    let breton = TargetLanguage::Breton.default_instruction();
    match mode {
        RetrievalMode::None => render_template(
            DEFAULT_TEMPLATE,
            &[("instruction", target.default_instruction()), ("text", text)],
        ),
        RetrievalMode::Similarity if !outcome.succeeded => render_template(
            SIMILARITY_UNAVAILABLE_TEMPLATE,
            &[("instruction", breton), ("text", text)],
        ),
        RetrievalMode::Similarity if outcome.examples.is_empty() => render_template(
            SIMILARITY_EMPTY_TEMPLATE,
            &[("instruction", breton), ("text", text)],
        ),
        RetrievalMode::Similarity => render_template(
            SIMILARITY_TEMPLATE,
            &[
                ("instruction", breton),
                ("examples", &example_blocks(&outcome.examples)),
                ("text", text),
            ],
        ),
        RetrievalMode::Random if !outcome.succeeded || outcome.examples.is_empty() => {
            render_template(
                RANDOM_UNAVAILABLE_TEMPLATE,
                &[("instruction", breton), ("text", text)],
            )
        }
        RetrievalMode::Random => render_template(
            RANDOM_TEMPLATE,
            &[("examples", &example_blocks(&outcome.examples)), ("text", text)],
        ),
    }
}

pub fn example_blocks(examples: &[Example]) -> String {
    let mut out = String::new();
    for ex in examples {
        out.push_str(&render_template(
            EXAMPLE_TEMPLATE,
            &[("source", &ex.source_text), ("target", &ex.target_text)],
        ));
    }
    out
}

/// Whether the prompt spells out the translation direction on its own.
///
/// The plain default header is the backend's own instruction and does not
/// count; any other occurrence of the instruction phrase does.
pub fn prompt_declares_direction(prompt: &str, target: TargetLanguage) -> bool {
    let phrase = target.default_instruction();
    let header = target.default_header();
    let body = prompt.strip_prefix(header.as_str()).unwrap_or(prompt);
    body.contains(phrase)
}

/// Replace `{{key}}` placeholders in one pass. Substituted values are never
/// re-scanned, so user text containing `{{...}}` is emitted verbatim.
/// Unknown placeholders are left as-is.
pub fn render_template(template: &str, vars: &[(&str, &str)]) -> String {
    let mut out = String::with_capacity(template.len() + vars.iter().map(|(_, v)| v.len()).sum::<usize>());
    let mut rest = template;
    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        match after.find("}}") {
            Some(end) => {
                let key = &after[..end];
                match vars.iter().find(|(k, _)| *k == key) {
                    Some((_, v)) => out.push_str(v),
                    None => {
                        out.push_str("{{");
                        out.push_str(key);
                        out.push_str("}}");
                    }
                }
                rest = &after[end + 2..];
            }
            None => {
                out.push_str(&rest[start..]);
                rest = "";
            }
        }
    }
    out.push_str(rest);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ex(s: &str, t: &str) -> Example {
        Example {
            source_text: s.to_string(),
            target_text: t.to_string(),
            score: None,
        }
    }

    #[test]
    fn default_prompt_depends_on_target() {
        let none = RetrievalOutcome::empty();
        assert_eq!(
            assemble_prompt(RetrievalMode::None, &none, "Bonjour", TargetLanguage::Breton),
            "Traduire en breton:\n\nBonjour"
        );
        assert_eq!(
            assemble_prompt(RetrievalMode::None, &none, "Bonjour", TargetLanguage::English),
            "Translate to English:\n\nBonjour"
        );
    }

    #[test]
    fn similarity_prompt_with_examples() {
        let outcome = RetrievalOutcome::found(vec![ex("A", "a"), ex("B", "b")]);
        assert_eq!(
            assemble_prompt(RetrievalMode::Similarity, &outcome, "Bonjour", TargetLanguage::Breton),
            "Traduire en breton en utilisant ces exemples :\n\nFrançais : A\nBreton : a\n\nFrançais : B\nBreton : b\n\nTexte à traduire en breton:\nBonjour"
        );
    }

    #[test]
    fn similarity_fallbacks() {
        assert_eq!(
            assemble_prompt(
                RetrievalMode::Similarity,
                &RetrievalOutcome::unavailable(),
                "Bonjour",
                TargetLanguage::Breton
            ),
            "Traduire en breton (RAG indisponible):\n\nBonjour"
        );
        assert_eq!(
            assemble_prompt(
                RetrievalMode::Similarity,
                &RetrievalOutcome::empty(),
                "Bonjour",
                TargetLanguage::English
            ),
            "Traduire en breton (aucun exemple similaire trouvé):\n\nBonjour"
        );
    }

    #[test]
    fn random_prompts() {
        let expected_fallback = "Traduire en breton (exemples aléatoires indisponibles):\n\nBonjour";
        for outcome in [RetrievalOutcome::empty(), RetrievalOutcome::unavailable()] {
            assert_eq!(
                assemble_prompt(RetrievalMode::Random, &outcome, "Bonjour", TargetLanguage::Breton),
                expected_fallback
            );
        }
        let outcome = RetrievalOutcome::found(vec![ex("C", "c")]);
        assert_eq!(
            assemble_prompt(RetrievalMode::Random, &outcome, "Bonjour", TargetLanguage::Breton),
            "Voici quelques paires français-breton aléatoires de la base de données:\n\nFrançais : C\nBreton : c\n\nTraduire le texte suivant en breton:\nBonjour"
        );
    }

    #[test]
    fn example_order_is_retrieval_order() {
        let outcome = RetrievalOutcome::found(vec![ex("zz", "1"), ex("aa", "2"), ex("mm", "3")]);
        let prompt =
            assemble_prompt(RetrievalMode::Similarity, &outcome, "x", TargetLanguage::Breton);
        let zz = prompt.find("Français : zz").expect("zz");
        let aa = prompt.find("Français : aa").expect("aa");
        let mm = prompt.find("Français : mm").expect("mm");
        assert!(zz < aa && aa < mm);
    }

    #[test]
    fn input_text_is_kept_verbatim() {
        let text = "  {{examples}} l'été,\n« déjà »  ";
        for mode in [RetrievalMode::None, RetrievalMode::Similarity, RetrievalMode::Random] {
            let prompt = assemble_prompt(
                mode,
                &RetrievalOutcome::unavailable(),
                text,
                TargetLanguage::Breton,
            );
            assert!(prompt.ends_with(text), "{mode:?}: {prompt:?}");
        }
    }

    #[test]
    fn assembly_is_deterministic() {
        let outcome = RetrievalOutcome::found(vec![ex("A", "a")]);
        let a = assemble_prompt(RetrievalMode::Similarity, &outcome, "t", TargetLanguage::Breton);
        let b = assemble_prompt(RetrievalMode::Similarity, &outcome, "t", TargetLanguage::Breton);
        assert_eq!(a, b);
    }

    #[test]
    fn direction_detection() {
        let b = TargetLanguage::Breton;
        assert!(!prompt_declares_direction("Traduire en breton:\n\nBonjour", b));
        assert!(prompt_declares_direction(
            "Traduire en breton (RAG indisponible):\n\nBonjour",
            b
        ));
        assert!(prompt_declares_direction(
            "Traduire en breton en utilisant ces exemples :\n\n...",
            b
        ));
        assert!(!prompt_declares_direction(
            "Voici quelques paires français-breton aléatoires de la base de données:\n\nTraduire le texte suivant en breton:\nx",
            b
        ));
        // The user may write the instruction themselves.
        assert!(prompt_declares_direction(
            "Traduire en breton:\n\nTraduire en breton ceci",
            b
        ));
    }

    #[test]
    fn render_template_single_pass() {
        assert_eq!(
            render_template("{{a}}-{{b}}", &[("a", "{{b}}"), ("b", "B")]),
            "{{b}}-B"
        );
        assert_eq!(render_template("{{missing}} {{", &[]), "{{missing}} {{");
    }
}
