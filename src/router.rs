use crate::prelude::*;
use crate::workers::{registry, WorkerKind};
use regex::Regex;

string_enum!(pub enum IntentKind {
    Investigate => "investigate",
    Analyze => "analyze",
    Report => "report",
    Explain => "explain",
    Greet => "greet",
    Help => "help",
    About => "about",
});

/// Below this confidence the query routes to the communicator regardless of
/// the classified kind.
pub const CONFIDENCE_FLOOR: f64 = 0.6;

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Intent {
    pub kind: IntentKind,
    pub confidence: f64,
}

string_enum!(pub enum EntityType {
    Year => "year",
    State => "state",
    Municipality => "municipality",
    Agency => "agency",
    Amount => "amount",
    DateRange => "date-range",
    DataSource => "data-source",
    Identifier => "identifier",
});

/// Extracted typed value. Entities form a multimap: the same type may repeat.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Entity {
    #[serde(rename = "type")]
    pub entity_type: EntityType,
    pub value: String,
    pub span: Option<(usize, usize)>,
}

impl Entity {
    fn new(entity_type: EntityType, value: &str, span: Option<(usize, usize)>) -> Self {
        Entity {
            entity_type,
            value: value.to_string(),
            span,
        }
    }
}

/// Keyword classes per intent, checked in a fixed order so ties break
/// deterministically. Queries arrive in Portuguese and occasionally English.
static INTENT_KEYWORDS: &[(IntentKind, &[&str])] = &[
    (
        IntentKind::Investigate,
        &[
            "investigar", "investigate", "investigação", "apurar", "fraude", "fraud",
            "corrupção", "corruption", "suspeito", "irregularidade", "sancionado",
            "superfaturamento", "desvio",
        ],
    ),
    (
        IntentKind::Analyze,
        &[
            "analisar", "analise", "análise", "analyze", "anomalia", "anomalies",
            "padrões", "padrão", "patterns", "comparar", "tendência", "gastos",
            "outlier", "evolução",
        ],
    ),
    (
        IntentKind::Report,
        &["relatório", "report", "resumo", "resumir", "sumário", "summarize"],
    ),
    (
        IntentKind::Explain,
        &["explicar", "explique", "explain", "como funciona", "o que é", "o que significa"],
    ),
    (
        IntentKind::About,
        &["quem é você", "sobre você", "about you", "o que você faz"],
    ),
    (
        IntentKind::Greet,
        &["olá", "oi", "bom dia", "boa tarde", "boa noite", "hello", "hi"],
    ),
    (
        IntentKind::Help,
        &["ajuda", "help", "exemplos", "o que posso"],
    ),
];

static UFS: &[(&str, &str)] = &[
    ("AC", "acre"), ("AL", "alagoas"), ("AP", "amapá"), ("AM", "amazonas"),
    ("BA", "bahia"), ("CE", "ceará"), ("DF", "distrito federal"),
    ("ES", "espírito santo"), ("GO", "goiás"), ("MA", "maranhão"),
    ("MT", "mato grosso"), ("MS", "mato grosso do sul"), ("MG", "minas gerais"),
    ("PA", "pará"), ("PB", "paraíba"), ("PR", "paraná"), ("PE", "pernambuco"),
    ("PI", "piauí"), ("RJ", "rio de janeiro"), ("RN", "rio grande do norte"),
    ("RS", "rio grande do sul"), ("RO", "rondônia"), ("RR", "roraima"),
    ("SC", "santa catarina"), ("SP", "são paulo"), ("SE", "sergipe"),
    ("TO", "tocantins"),
];

static CAPITALS: &[(&str, &str)] = &[
    ("belo horizonte", "MG"), ("são paulo", "SP"), ("rio de janeiro", "RJ"),
    ("salvador", "BA"), ("fortaleza", "CE"), ("recife", "PE"), ("manaus", "AM"),
    ("curitiba", "PR"), ("porto alegre", "RS"), ("brasília", "DF"),
    ("belém", "PA"), ("goiânia", "GO"), ("campinas", "SP"), ("uberlândia", "MG"),
];

/// Query terms naming an upstream capability.
static DATA_SOURCES: &[(&str, &str)] = &[
    ("contrato", "contracts"), ("contract", "contracts"),
    ("despesa", "expenses"), ("expense", "expenses"),
    ("convênio", "agreements"), ("convenio", "agreements"),
    ("licitaç", "procurement"), ("bidding", "procurement"), ("procurement", "procurement"),
    ("servidor", "servants"), ("remuneraç", "servants"),
    ("viagem", "travel"), ("viagens", "travel"),
    ("cartão", "cards"), ("cartao", "cards"),
    ("sanç", "sanctions"), ("sanction", "sanctions"), ("ceis", "sanctions"),
    ("bolsa família", "benefits"), ("bolsa familia", "benefits"), ("benefício", "benefits"),
    ("emenda", "amendments"),
    ("diário oficial", "gazettes"), ("diario oficial", "gazettes"),
];

lazy_static! {
    static ref YEAR_RE: Regex = Regex::new(r"\b(19\d{2}|20\d{2})\b").unwrap();
    static ref AGENCY_RE: Regex =
        Regex::new(r"(?:órgão|orgao|agency|siafi)\s+(\d{4,5})\b").unwrap();
    static ref AMOUNT_RE: Regex = Regex::new(
        r"(?i)(?:r\$\s*)?(\d+(?:[.,]\d+)*)\s*(mil|milhão|milhões|milhao|milhoes|bilhão|bilhões|bilhao|bilhoes|million|m\b|k\b)"
    )
    .unwrap();
    static ref DATE_RANGE_RE: Regex =
        Regex::new(r"(?:de|entre|from)\s+(19\d{2}|20\d{2})\s+(?:a|e|até|to|and)\s+(19\d{2}|20\d{2})").unwrap();
    static ref CNPJ_RE: Regex =
        Regex::new(r"\b\d{2}\.?\d{3}\.?\d{3}/?\d{4}-?\d{2}\b").unwrap();
}

/// Deterministic keyword classification. Confidence grows with the number of
/// matched terms and never reaches 1.0.
pub fn classify(query_text: &str) -> Intent {
    let lowered = query_text.to_lowercase();

    let mut best: Option<(IntentKind, usize)> = None;
    for (kind, keywords) in INTENT_KEYWORDS {
        let hits = keywords.iter().filter(|kw| lowered.contains(*kw)).count();
        if hits > 0 && best.map(|(_, top)| hits > top).unwrap_or(true) {
            best = Some((*kind, hits));
        }
    }

    match best {
        Some((kind, hits)) => Intent {
            kind,
            confidence: (0.5 + 0.15 * hits as f64).min(0.95),
        },
        None => Intent {
            kind: IntentKind::Help,
            confidence: 0.3,
        },
    }
}

pub fn extract_entities(query_text: &str) -> Vec<Entity> {
    let lowered = query_text.to_lowercase();
    let mut entities = Vec::new();

    // Ranges first so their years are not re-extracted individually.
    let mut range_years = Vec::new();
    for captures in DATE_RANGE_RE.captures_iter(&lowered) {
        let (start, end) = (&captures[1], &captures[2]);
        range_years.push(start.to_string());
        range_years.push(end.to_string());
        let span = captures.get(0).map(|m| (m.start(), m.end()));
        entities.push(Entity::new(
            EntityType::DateRange,
            &format!("{start}..{end}"),
            span,
        ));
    }

    for m in YEAR_RE.find_iter(&lowered) {
        if !range_years.contains(&m.as_str().to_string()) {
            entities.push(Entity::new(
                EntityType::Year,
                m.as_str(),
                Some((m.start(), m.end())),
            ));
        }
    }

    // Abbreviations only count when written in uppercase ("MG"), otherwise
    // common short words ("se", "to") would read as states.
    let tokens: Vec<&str> = query_text
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .collect();
    for (uf, name) in UFS {
        if lowered.contains(name) || tokens.contains(uf) {
            entities.push(Entity::new(EntityType::State, uf, None));
        }
    }

    for (city, uf) in CAPITALS {
        if lowered.contains(city) {
            entities.push(Entity::new(EntityType::Municipality, city, None));
            if !entities
                .iter()
                .any(|e| e.entity_type == EntityType::State && e.value == *uf)
            {
                entities.push(Entity::new(EntityType::State, uf, None));
            }
        }
    }

    for captures in AGENCY_RE.captures_iter(&lowered) {
        let span = captures.get(1).map(|m| (m.start(), m.end()));
        entities.push(Entity::new(EntityType::Agency, &captures[1], span));
    }

    for captures in AMOUNT_RE.captures_iter(&lowered) {
        let number: f64 = captures[1].replace('.', "").replace(',', ".").parse().unwrap_or(0.0);
        let multiplier = match captures[2].to_lowercase().as_str() {
            "mil" | "k" => 1_000.0,
            "bilhão" | "bilhões" | "bilhao" | "bilhoes" => 1_000_000_000.0,
            _ => 1_000_000.0,
        };
        let span = captures.get(0).map(|m| (m.start(), m.end()));
        entities.push(Entity::new(
            EntityType::Amount,
            &format!("{:.0}", number * multiplier),
            span,
        ));
    }

    for (term, source) in DATA_SOURCES {
        if lowered.contains(term)
            && !entities
                .iter()
                .any(|e| e.entity_type == EntityType::DataSource && e.value == *source)
        {
            entities.push(Entity::new(EntityType::DataSource, source, None));
        }
    }

    for m in CNPJ_RE.find_iter(query_text) {
        entities.push(Entity::new(
            EntityType::Identifier,
            m.as_str(),
            Some((m.start(), m.end())),
        ));
    }

    entities
}

/// Deterministic worker selection. Ties break on the registry's declared
/// priority, then kind name; unknown capabilities fall back to the
/// communicator.
pub fn select_workers(intent: &Intent, entities: &[Entity]) -> Vec<WorkerKind> {
    if intent.confidence < CONFIDENCE_FLOOR
        || matches!(
            intent.kind,
            IntentKind::Help | IntentKind::Greet | IntentKind::About | IntentKind::Explain
        )
    {
        return vec![WorkerKind::Communicator];
    }

    let has = |entity_type: EntityType| entities.iter().any(|e| e.entity_type == entity_type);
    let has_source = |source: &str| {
        entities
            .iter()
            .any(|e| e.entity_type == EntityType::DataSource && e.value == source)
    };

    let mut capabilities = vec!["anomalies", "patterns"];
    if intent.kind == IntentKind::Investigate || has_source("sanctions") {
        capabilities.push("integrity");
    }
    if has(EntityType::State) || has(EntityType::Municipality) {
        capabilities.push("regional");
    }
    if intent.kind == IntentKind::Investigate || has_source("gazettes") {
        capabilities.push("textual");
    }
    capabilities.push("aggregate");
    capabilities.push("report");

    let mut selected: Vec<(u8, WorkerKind)> = Vec::new();
    for capability in capabilities {
        // Missing capabilities are skipped, not fatal: the catalog is
        // allowed to ship a subset of what the router knows about.
        if let Some(descriptor) = registry::lookup_by_capability(capability).first() {
            if !selected.iter().any(|(_, kind)| *kind == descriptor.kind) {
                selected.push((descriptor.priority, descriptor.kind));
            }
        }
    }

    if selected.is_empty() {
        return vec![WorkerKind::Communicator];
    }

    selected.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.to_str().cmp(b.1.to_str())));
    selected.into_iter().map(|(_, kind)| kind).collect()
}

#[cfg(test)]
mod tests {
    use super::{classify, extract_entities, select_workers, EntityType, Intent, IntentKind};
    use crate::workers::WorkerKind;

    #[test]
    fn test_classification() {
        let intent = classify("analisar anomalias em contratos de 2024");
        assert_eq!(intent.kind, IntentKind::Analyze);
        assert!(intent.confidence >= 0.6);

        let intent = classify("investigar fraude e corrupção em licitações");
        assert_eq!(intent.kind, IntentKind::Investigate);
        assert!(intent.confidence >= 0.8);

        let intent = classify("bom dia");
        assert_eq!(intent.kind, IntentKind::Greet);

        // Gibberish falls through to help with low confidence.
        let intent = classify("xyzzy plugh");
        assert_eq!(intent.kind, IntentKind::Help);
        assert!(intent.confidence < 0.6);
    }

    #[test]
    fn test_entity_extraction() {
        let entities =
            extract_entities("analyze 2024 contracts over 1 milhão in agency 26000 em Minas Gerais");

        let values: Vec<(EntityType, &str)> = entities
            .iter()
            .map(|e| (e.entity_type, e.value.as_str()))
            .collect();

        assert!(values.contains(&(EntityType::Year, "2024")));
        assert!(values.contains(&(EntityType::State, "MG")));
        assert!(values.contains(&(EntityType::Agency, "26000")));
        assert!(values.contains(&(EntityType::Amount, "1000000")));
        assert!(values.contains(&(EntityType::DataSource, "contracts")));
    }

    #[test]
    fn test_date_range_subsumes_years() {
        let entities = extract_entities("despesas de 2020 a 2023");
        assert!(entities
            .iter()
            .any(|e| e.entity_type == EntityType::DateRange && e.value == "2020..2023"));
        assert!(!entities.iter().any(|e| e.entity_type == EntityType::Year));
    }

    #[test]
    fn test_identifier_extraction() {
        let entities = extract_entities("contratos do CNPJ 11.222.333/0001-44");
        assert!(entities
            .iter()
            .any(|e| e.entity_type == EntityType::Identifier && e.value == "11.222.333/0001-44"));
    }

    #[test]
    fn test_selection_is_deterministic() {
        let intent = classify("investigar contratos sancionados em MG em 2024");
        let entities = extract_entities("investigar contratos sancionados em MG em 2024");

        let first = select_workers(&intent, &entities);
        let second = select_workers(&intent, &entities);
        assert_eq!(first, second);

        assert!(first.contains(&WorkerKind::AnomalyDetector));
        assert!(first.contains(&WorkerKind::CorruptionDetector));
        assert!(first.contains(&WorkerKind::RegionalAnalyst));
        assert!(first.contains(&WorkerKind::ReportWriter));
        assert!(!first.contains(&WorkerKind::Communicator));
    }

    #[test]
    fn test_low_confidence_forces_communicator() {
        let intent = Intent {
            kind: IntentKind::Analyze,
            confidence: 0.4,
        };
        assert_eq!(select_workers(&intent, &[]), vec![WorkerKind::Communicator]);
    }

    #[test]
    fn test_greet_routes_to_communicator() {
        let intent = classify("olá, bom dia");
        assert_eq!(select_workers(&intent, &[]), vec![WorkerKind::Communicator]);
    }
}
