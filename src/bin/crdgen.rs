use kube::core::CustomResourceExt;
use usage_guard::crd::usage::Usage;

fn main() {
    let crd = Usage::crd();
    let yaml = serde_yaml::to_string(&crd).expect("serialize CRD to YAML");
    println!("{}", yaml);
}
