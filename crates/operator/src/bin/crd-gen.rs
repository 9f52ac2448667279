use kube::CustomResourceExt;
use odoo_operator::OdooDeployment;

fn main() -> anyhow::Result<()> {
    let crd = OdooDeployment::crd();
    let yaml = serde_yaml::to_string(&crd)?;
    println!("{}", yaml);
    Ok(())
}
