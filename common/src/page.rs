use crate::types::LinkAddress;

const INDEX_HTML: &str = r#"<!doctype html>
<html lang="en">
<head>
  <meta charset="utf-8">
  <meta name="viewport" content="width=device-width, initial-scale=1">
  <title>Climate Node</title>
  <style>
    body{font-family:Arial,sans-serif;background:#282c34;color:#fff;margin:0;padding:20px;display:flex;justify-content:center}
    .card{background:#3b3f46;border-radius:8px;padding:20px;width:100%;max-width:600px;text-align:center}
    h1{color:#61dafb}.data{font-size:24px;margin:20px 0}.muted{color:#888;font-size:14px}
    button{background:#007bff;border:none;color:#fff;padding:15px 30px;font-size:16px;border-radius:5px;margin:10px;cursor:pointer}
  </style>
  <script>
    async function fetchData(){
      try{
        const r=await fetch('/data');
        const d=await r.json();
        const t=d.valid?d.temperature+' °C':'--';
        const h=d.valid?d.humidity+' %':'--';
        document.getElementById('temperature').innerText='Temperature: '+t;
        document.getElementById('humidity').innerText='Humidity: '+h;
      }catch(e){console.error('Error fetching data:',e);}
    }
    function led(state){
      fetch('/ws',{method:'POST',headers:{'Content-Type':'application/x-www-form-urlencoded'},body:'led='+state})
        .then(r=>r.text()).then(t=>{document.getElementById('ack').innerText=t;})
        .catch(e=>console.error('Error:',e));
    }
    setInterval(fetchData,2000);
    window.onload=fetchData;
  </script>
</head>
<body>
  <div class="card">
    <h1>Climate Node</h1>
    <div id="temperature" class="data">Temperature: -- °C</div>
    <div id="humidity" class="data">Humidity: -- %</div>
    <button onclick="led('on')">LED On</button>
    <button onclick="led('off')">LED Off</button>
    <p id="ack" class="muted"></p>
    <p class="muted">Device address: {{ADDRESS}}</p>
  </div>
</body>
</html>
"#;

pub fn render_index(address: LinkAddress) -> String {
    INDEX_HTML.replace("{{ADDRESS}}", &address.to_string())
}
