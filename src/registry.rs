use crate::cache::TtlClass;
use crate::errors::ErrorKind;
use crate::prelude::*;
use indexmap::IndexMap;

string_enum!(pub enum AuthMode {
    Open => "open",
    ApiKey => "api-key",
    Bearer => "bearer",
});

string_enum!(pub enum RateClass {
    Light => "light",
    Standard => "standard",
    Strict => "strict",
});

impl RateClass {
    /// Token bucket refill rate, in requests per minute.
    pub fn per_minute(&self) -> u32 {
        match self {
            RateClass::Light => 700,
            RateClass::Standard => 90,
            RateClass::Strict => 30,
        }
    }
}

/// One upstream data source. The registry is the only place that knows
/// upstream URLs; everything else names endpoints by their symbolic id.
#[derive(Clone, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct EndpointSpec {
    pub id: &'static str,
    pub base_url: &'static str,
    pub auth: AuthMode,
    /// Environment variable holding the API key, for `api-key`/`bearer` auth.
    pub key_env: Option<&'static str>,
    /// Header name carrying the key, for `api-key` auth.
    pub key_header: Option<&'static str>,
    pub rate_class: RateClass,
    pub ttl_class: TtlClass,
    pub capability: &'static str,
    pub typical_latency_ms: u64,
}

const TRANSPARENCIA_KEY: Option<&str> = Some("TRANSPARENCIA_API_KEY");
const TRANSPARENCIA_HEADER: Option<&str> = Some("chave-api-dados");

macro_rules! transparencia {
    ($id:expr, $path:expr, $ttl:ident, $cap:expr) => {
        EndpointSpec {
            id: $id,
            base_url: concat!(
                "https://api.portaldatransparencia.gov.br/api-de-dados/",
                $path
            ),
            auth: AuthMode::ApiKey,
            key_env: TRANSPARENCIA_KEY,
            key_header: TRANSPARENCIA_HEADER,
            rate_class: RateClass::Standard,
            ttl_class: TtlClass::$ttl,
            capability: $cap,
            typical_latency_ms: 800,
        }
    };
}

macro_rules! open_endpoint {
    ($id:expr, $url:expr, $rate:ident, $ttl:ident, $cap:expr, $lat:expr) => {
        EndpointSpec {
            id: $id,
            base_url: $url,
            auth: AuthMode::Open,
            key_env: None,
            key_header: None,
            rate_class: RateClass::$rate,
            ttl_class: TtlClass::$ttl,
            capability: $cap,
            typical_latency_ms: $lat,
        }
    };
}

fn seed() -> Vec<EndpointSpec> {
    vec![
        // Portal da Transparência (Controladoria-Geral da União)
        transparencia!("contracts", "contratos", Medium, "contracts"),
        transparencia!("contracts-by-agency", "contratos/cpf-cnpj", Medium, "contracts"),
        transparencia!("expenses", "despesas/documentos", Medium, "expenses"),
        transparencia!("expenses-by-agency", "despesas/por-orgao", Medium, "expenses"),
        transparencia!("agreements", "convenios", Medium, "agreements"),
        transparencia!("procurement", "licitacoes", Medium, "procurement"),
        transparencia!("public-servants", "servidores", Long, "servants"),
        transparencia!("servant-remuneration", "servidores/remuneracao", Long, "servants"),
        transparencia!("travel-allowances", "viagens", Medium, "travel"),
        transparencia!("corporate-cards", "cartoes", Medium, "cards"),
        transparencia!("sanctioned-companies", "ceis", Long, "sanctions"),
        transparencia!("punished-companies", "cnep", Long, "sanctions"),
        transparencia!("expelled-servants", "ceaf", Long, "sanctions"),
        transparencia!("bolsa-familia", "novo-bolsa-familia-sacado-por-nis", Medium, "benefits"),
        transparencia!("bpc-benefits", "bpc-por-municipio", Medium, "benefits"),
        transparencia!("emendas", "emendas", Medium, "amendments"),
        transparencia!("siafi-agencies", "orgaos-siafi", Long, "agencies"),
        // IBGE
        open_endpoint!(
            "ibge-states",
            "https://servicodados.ibge.gov.br/api/v1/localidades/estados",
            Light, Long, "geography", 300
        ),
        open_endpoint!(
            "ibge-municipalities",
            "https://servicodados.ibge.gov.br/api/v1/localidades/municipios",
            Light, Long, "geography", 500
        ),
        open_endpoint!(
            "ibge-population",
            "https://servicodados.ibge.gov.br/api/v3/agregados/6579/periodos/-1/variaveis/9324",
            Light, Long, "demographics", 900
        ),
        // Compras.gov.br
        open_endpoint!(
            "compras-contracts",
            "https://compras.dados.gov.br/comprasContratos/v1/contratos.json",
            Standard, Medium, "procurement", 1200
        ),
        open_endpoint!(
            "compras-suppliers",
            "https://compras.dados.gov.br/fornecedores/v1/fornecedores.json",
            Standard, Long, "companies", 1200
        ),
        // Câmara dos Deputados / Senado Federal
        open_endpoint!(
            "camara-deputies",
            "https://dadosabertos.camara.leg.br/api/v2/deputados",
            Light, Long, "legislative", 400
        ),
        open_endpoint!(
            "camara-proposals",
            "https://dadosabertos.camara.leg.br/api/v2/proposicoes",
            Light, Medium, "legislative", 600
        ),
        open_endpoint!(
            "camara-expenses",
            "https://dadosabertos.camara.leg.br/api/v2/deputados/{id}/despesas",
            Light, Medium, "legislative", 700
        ),
        open_endpoint!(
            "senado-senators",
            "https://legis.senado.leg.br/dadosabertos/senador/lista/atual",
            Light, Long, "legislative", 600
        ),
        // Banco Central / IPEA series
        open_endpoint!(
            "bacen-ipca",
            "https://api.bcb.gov.br/dados/serie/bcdata.sgs.433/dados",
            Light, Long, "economic", 400
        ),
        open_endpoint!(
            "bacen-selic",
            "https://api.bcb.gov.br/dados/serie/bcdata.sgs.432/dados",
            Light, Long, "economic", 400
        ),
        open_endpoint!(
            "ipea-series",
            "http://www.ipeadata.gov.br/api/odata4/Metadados",
            Standard, Long, "economic", 1500
        ),
        // Company lookups and gazettes
        open_endpoint!(
            "company-registry",
            "https://minhareceita.org/{cnpj}",
            Standard, Long, "companies", 700
        ),
        open_endpoint!(
            "official-gazettes",
            "https://queridodiario.ok.org.br/api/gazettes",
            Standard, Medium, "gazettes", 1000
        ),
        open_endpoint!(
            "dados-gov-datasets",
            "https://dados.gov.br/api/publico/conjuntos-dados",
            Standard, Long, "catalog", 900
        ),
    ]
}

lazy_static! {
    static ref REGISTRY: IndexMap<&'static str, EndpointSpec> = {
        let mut map = IndexMap::new();
        for spec in seed() {
            let previous = map.insert(spec.id, spec);
            assert!(previous.is_none(), "duplicate endpoint id in registry");
        }
        map
    };
}

pub fn lookup(id: &str) -> Result<&'static EndpointSpec, ErrorKind> {
    REGISTRY
        .get(id)
        .ok_or_else(|| ErrorKind::NotFound(format!("endpoint {id}")))
}

/// All endpoints providing a capability, in seed order (deterministic).
pub fn by_capability(capability: &str) -> Vec<&'static EndpointSpec> {
    REGISTRY
        .values()
        .filter(|spec| spec.capability == capability)
        .collect()
}

pub fn all() -> impl Iterator<Item = &'static EndpointSpec> {
    REGISTRY.values()
}

/// Every environment variable the catalog may pull an API key from.
pub fn key_env_vars() -> Vec<String> {
    let mut vars: Vec<String> = REGISTRY
        .values()
        .filter_map(|spec| spec.key_env.map(|v| v.to_string()))
        .collect();
    vars.dedup();
    vars
}
